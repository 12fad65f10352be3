use crate::config::Timeframe;
use crate::models::{Balance, Candle, Order, OrderRequest};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// Market data and order capability shared by the backtest and live engines.
///
/// Historical data comes back ascending by timestamp and limited to `from..=to`.
#[async_trait]
pub trait Exchange: Send + Sync {
    async fn get_historical_data(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>>;

    async fn place_order(&self, request: &OrderRequest) -> Result<Order>;

    async fn get_order(&self, symbol: &str, order_id: &str) -> Result<Order>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<Order>;

    async fn get_balance(&self, asset: &str) -> Result<Balance>;
}

pub type SharedExchange = Arc<dyn Exchange>;
