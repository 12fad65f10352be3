use crate::config::Timeframe;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Movement {
    Up,
    Down,
}

impl Movement {
    pub fn from_prices(open: f64, close: f64) -> Self {
        if close > open {
            Movement::Up
        } else {
            Movement::Down
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Movement::Up => "up",
            Movement::Down => "down",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub trade_count: u64,
    pub movement: Movement,
}

impl Candle {
    pub fn new(
        timestamp: DateTime<Utc>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
        trade_count: u64,
    ) -> Self {
        Self {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
            trade_count,
            movement: Movement::from_prices(open, close),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SignalType {
    Buy,
    Sell,
}

impl SignalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalType::Buy => "buy",
            SignalType::Sell => "sell",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub symbol: String,
    pub signal_type: SignalType,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub use_hold_strategy: bool,
}

impl Signal {
    pub fn new(symbol: &str, signal_type: SignalType, price: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            signal_type,
            price,
            timestamp,
            stop_loss: None,
            take_profit: None,
            use_hold_strategy: false,
        }
    }

    pub fn buy(symbol: &str, price: f64, timestamp: DateTime<Utc>) -> Self {
        Self::new(symbol, SignalType::Buy, price, timestamp)
    }

    pub fn sell(symbol: &str, price: f64, timestamp: DateTime<Utc>) -> Self {
        Self::new(symbol, SignalType::Sell, price, timestamp)
    }

    pub fn is_buy(&self) -> bool {
        self.signal_type == SignalType::Buy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSide {
    Long,
    Short,
}

impl TradeSide {
    pub fn for_entry(signal_type: SignalType) -> Self {
        match signal_type {
            SignalType::Buy => TradeSide::Long,
            SignalType::Sell => TradeSide::Short,
        }
    }

    /// The signal type that would close a position on this side.
    pub fn closing_signal(&self) -> SignalType {
        match self {
            TradeSide::Long => SignalType::Sell,
            TradeSide::Short => SignalType::Buy,
        }
    }

    pub fn direction(&self) -> f64 {
        match self {
            TradeSide::Long => 1.0,
            TradeSide::Short => -1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeOutcome {
    TakeProfit,
    StopLoss,
    Closed,
    MovedToHold,
}

impl TradeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TradeOutcome::TakeProfit => "take_profit",
            TradeOutcome::StopLoss => "stop_loss",
            TradeOutcome::Closed => "closed",
            TradeOutcome::MovedToHold => "moved_to_hold",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub id: String,
    pub symbol: String,
    pub side: TradeSide,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_timestamp: DateTime<Utc>,
    pub exit_price: Option<f64>,
    pub exit_timestamp: Option<DateTime<Utc>>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub amount_invested: f64,
    pub entry_commission: f64,
    pub exit_commission: f64,
    pub pnl: f64,
    pub use_hold_strategy: bool,
    pub outcome: Option<TradeOutcome>,
}

impl Trade {
    pub fn entry_value(&self) -> f64 {
        self.quantity * self.entry_price
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeldAsset {
    pub symbol: String,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_timestamp: DateTime<Utc>,
    pub market_price: f64,
    pub market_value: f64,
    pub unrealized_pnl: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceSummary {
    pub total_trades: usize,
    pub total_return: f64,
    pub total_return_percent: f64,
    pub win_rate: f64,
    pub avg_trade_pnl: f64,
    pub best_trade: f64,
    pub worst_trade: f64,
    pub trade_pnl_std_dev: f64,
    pub max_drawdown: f64,
    pub max_drawdown_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResult {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub starting_capital: f64,
    pub final_capital: f64,
    pub realized_pnl: f64,
    pub win_count: usize,
    pub loss_count: usize,
    pub hold_count: usize,
    pub trade_history: Vec<Trade>,
    pub held_assets: Vec<HeldAsset>,
    pub performance: PerformanceSummary,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "FILLED" => OrderStatus::Filled,
            "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
            "CANCELED" | "CANCELLED" | "EXPIRED" | "PENDING_CANCEL" => OrderStatus::Canceled,
            "REJECTED" => OrderStatus::Rejected,
            _ => OrderStatus::New,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: f64,
    pub locked: f64,
}

/// Emitted by the trading engine right after an order changes its position state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPlaced {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub timestamp: DateTime<Utc>,
}
