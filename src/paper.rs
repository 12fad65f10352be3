use crate::config::Timeframe;
use crate::exchange::{Exchange, SharedExchange};
use crate::models::{Balance, Candle, Order, OrderRequest, OrderSide, OrderStatus, OrderType};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct PaperBook {
    balances: HashMap<String, Balance>,
    orders: HashMap<String, Order>,
}

impl PaperBook {
    fn balance_mut(&mut self, asset: &str) -> &mut Balance {
        self.balances
            .entry(asset.to_string())
            .or_insert_with(|| Balance {
                asset: asset.to_string(),
                free: 0.0,
                locked: 0.0,
            })
    }
}

/// In-memory exchange: history comes from the wrapped source, orders settle against local balances.
///
/// Market orders fill immediately at the request price. Limit orders lock funds and rest until
/// cancelled.
pub struct PaperExchange {
    data_source: SharedExchange,
    quote_asset: String,
    book: Mutex<PaperBook>,
}

impl PaperExchange {
    pub fn new(data_source: SharedExchange, quote_asset: &str, quote_balance: f64) -> Self {
        let mut book = PaperBook::default();
        book.balance_mut(&quote_asset.to_uppercase()).free = quote_balance;
        Self {
            data_source,
            quote_asset: quote_asset.to_uppercase(),
            book: Mutex::new(book),
        }
    }

    fn base_asset<'a>(&self, symbol: &'a str) -> Result<&'a str> {
        symbol
            .strip_suffix(self.quote_asset.as_str())
            .filter(|base| !base.is_empty())
            .ok_or_else(|| anyhow!("{} is not quoted in {}", symbol, self.quote_asset))
    }

    fn lock_book(&self) -> Result<std::sync::MutexGuard<'_, PaperBook>> {
        self.book
            .lock()
            .map_err(|_| anyhow!("paper exchange state is poisoned"))
    }
}

#[async_trait]
impl Exchange for PaperExchange {
    async fn get_historical_data(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Candle>> {
        self.data_source
            .get_historical_data(symbol, timeframe, from, to)
            .await
    }

    async fn place_order(&self, request: &OrderRequest) -> Result<Order> {
        let price = request
            .price
            .filter(|price| *price > 0.0 && price.is_finite())
            .ok_or_else(|| anyhow!("paper order for {} requires a positive price", request.symbol))?;
        if request.quantity <= 0.0 || !request.quantity.is_finite() {
            return Err(anyhow!(
                "paper order for {} requires a positive quantity",
                request.symbol
            ));
        }
        let base = self.base_asset(&request.symbol)?.to_string();
        let quote = self.quote_asset.clone();
        let notional = request.quantity * price;

        let mut book = self.lock_book()?;
        let (spend_asset, spend_amount) = match request.side {
            OrderSide::Buy => (quote.clone(), notional),
            OrderSide::Sell => (base.clone(), request.quantity),
        };
        let available = book.balance_mut(&spend_asset).free;

        let status = if available + 1e-12 < spend_amount {
            log::warn!(
                "Paper {} {} {} rejected: needs {:.8} {}, has {:.8}",
                request.side,
                request.quantity,
                request.symbol,
                spend_amount,
                spend_asset,
                available
            );
            OrderStatus::Rejected
        } else {
            let spend = book.balance_mut(&spend_asset);
            spend.free -= spend_amount;
            match request.order_type {
                OrderType::Market => {
                    match request.side {
                        OrderSide::Buy => book.balance_mut(&base).free += request.quantity,
                        OrderSide::Sell => book.balance_mut(&quote).free += notional,
                    }
                    OrderStatus::Filled
                }
                OrderType::Limit => {
                    book.balance_mut(&spend_asset).locked += spend_amount;
                    OrderStatus::New
                }
            }
        };

        let order = Order {
            id: Uuid::new_v4().to_string(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: Some(price),
            status,
            created_at: Utc::now(),
        };
        book.orders.insert(order.id.clone(), order.clone());
        Ok(order)
    }

    async fn get_order(&self, _symbol: &str, order_id: &str) -> Result<Order> {
        self.lock_book()?
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown paper order {}", order_id))
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<Order> {
        let base = self.base_asset(symbol)?.to_string();
        let quote = self.quote_asset.clone();
        let mut book = self.lock_book()?;
        let order = book
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown paper order {}", order_id))?;
        if order.status != OrderStatus::New {
            return Ok(order);
        }

        let price = order.price.unwrap_or(0.0);
        let (asset, amount) = match order.side {
            OrderSide::Buy => (quote, order.quantity * price),
            OrderSide::Sell => (base, order.quantity),
        };
        let balance = book.balance_mut(&asset);
        balance.locked -= amount;
        balance.free += amount;

        let mut cancelled = order;
        cancelled.status = OrderStatus::Canceled;
        book.orders.insert(cancelled.id.clone(), cancelled.clone());
        Ok(cancelled)
    }

    async fn get_balance(&self, asset: &str) -> Result<Balance> {
        Ok(self.lock_book()?.balance_mut(&asset.to_uppercase()).clone())
    }
}
