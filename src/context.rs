use crate::backtest::BacktestEngine;
use crate::binance::BinanceClient;
use crate::cache::CachedExchange;
use crate::config::{BacktestParameters, ExchangeSettings, Timeframe};
use crate::exchange::SharedExchange;
use crate::models::{BacktestResult, Candle};
use crate::paper::PaperExchange;
use crate::sessions::SessionManager;
use crate::strategy::StrategyConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::info;
use std::sync::Arc;

/// Wires the exchange stack once and hands it to the backtest and live entry points.
#[derive(Clone)]
pub struct AppContext {
    exchange: SharedExchange,
}

impl AppContext {
    /// Binance client, optionally behind the candle cache, optionally behind paper trading.
    pub fn initialize(settings: &ExchangeSettings) -> Result<Self> {
        let mut exchange: SharedExchange = Arc::new(BinanceClient::new(settings)?);
        if let Some(cache_dir) = &settings.cache_dir {
            info!("Caching historical candles in {}", cache_dir.display());
            exchange = Arc::new(CachedExchange::new(exchange, cache_dir.clone()));
        }
        if settings.paper_trading {
            info!(
                "Paper trading with {:.2} {}",
                settings.paper_quote_balance, settings.paper_quote_asset
            );
            exchange = Arc::new(PaperExchange::new(
                exchange,
                &settings.paper_quote_asset,
                settings.paper_quote_balance,
            ));
        }
        Ok(Self { exchange })
    }

    pub fn from_exchange(exchange: SharedExchange) -> Self {
        Self { exchange }
    }

    pub fn exchange(&self) -> SharedExchange {
        Arc::clone(&self.exchange)
    }

    pub async fn run_backtest(
        &self,
        parameters: &BacktestParameters,
        strategy_config: &StrategyConfig,
    ) -> Result<BacktestResult> {
        let strategy = strategy_config
            .build()
            .with_context(|| format!("Invalid strategy config '{}'", strategy_config.strategy))?;
        BacktestEngine::new(self.exchange()).run(&strategy, parameters).await
    }

    pub async fn load_candles(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        self.exchange
            .get_historical_data(symbol, timeframe, from, to)
            .await
            .with_context(|| format!("Failed to load {} {} candles", symbol, timeframe))
    }

    pub fn session_manager(&self) -> SessionManager {
        SessionManager::new(self.exchange())
    }
}
