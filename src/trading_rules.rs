use crate::config::{TradeSizeMode, TradeSizing};
use crate::models::{Candle, TradeSide};

pub const PRICE_EPSILON: f64 = 1e-9;

/// Capital at or below this amount never opens a new position.
pub const MIN_CAPITAL_THRESHOLD: f64 = 1.0;

/// Slipped fill for an order that buys (`is_buy`) or sells. Slippage always hurts.
pub fn apply_slippage(price: f64, is_buy: bool, slippage_rate: f64) -> f64 {
    if is_buy {
        price * (1.0 + slippage_rate)
    } else {
        price * (1.0 - slippage_rate)
    }
}

/// Entering a long buys, entering a short sells.
pub fn apply_entry_slippage(price: f64, side: TradeSide, slippage_rate: f64) -> f64 {
    apply_slippage(price, side == TradeSide::Long, slippage_rate)
}

/// Exiting a long sells, exiting a short buys.
pub fn apply_exit_slippage(price: f64, side: TradeSide, slippage_rate: f64) -> f64 {
    apply_slippage(price, side == TradeSide::Short, slippage_rate)
}

/// Notional requested by the sizing rule before any clamping.
pub fn requested_trade_amount(sizing: &TradeSizing, capital: f64) -> f64 {
    match sizing.mode {
        TradeSizeMode::FixedAmount => sizing.value,
        TradeSizeMode::PercentageOfCapital => capital.max(0.0) * sizing.value / 100.0,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PositionAllocation {
    pub quantity: f64,
    pub amount: f64,
    pub commission: f64,
}

#[derive(Debug, PartialEq)]
pub enum PositionSizingOutcome {
    Sized(PositionAllocation),
    TooSmall,
    InsufficientCapital { available: f64 },
}

/// Sizes an entry so that notional plus entry commission never exceeds `capital`.
pub fn determine_position_size(
    sizing: &TradeSizing,
    capital: f64,
    fill_price: f64,
    commission_rate: f64,
) -> PositionSizingOutcome {
    if !capital.is_finite() || capital <= MIN_CAPITAL_THRESHOLD {
        return PositionSizingOutcome::InsufficientCapital { available: capital };
    }
    if !fill_price.is_finite() || fill_price <= 0.0 {
        return PositionSizingOutcome::TooSmall;
    }

    let affordable = capital / (1.0 + commission_rate.max(0.0));
    let amount = requested_trade_amount(sizing, capital).min(affordable);
    if amount <= PRICE_EPSILON {
        return PositionSizingOutcome::TooSmall;
    }

    PositionSizingOutcome::Sized(PositionAllocation {
        quantity: amount / fill_price,
        amount,
        commission: amount * commission_rate,
    })
}

/// Quantity for a live order sized against the free quote balance.
pub fn live_order_quantity(sizing: &TradeSizing, free_quote: f64, price: f64) -> Option<f64> {
    if price <= 0.0 || !price.is_finite() {
        return None;
    }
    let amount = requested_trade_amount(sizing, free_quote);
    if amount <= PRICE_EPSILON {
        return None;
    }
    Some(amount / price)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitTrigger {
    StopLoss(f64),
    TakeProfit(f64),
}

impl ExitTrigger {
    pub fn price(&self) -> f64 {
        match self {
            ExitTrigger::StopLoss(price) | ExitTrigger::TakeProfit(price) => *price,
        }
    }
}

/// Resolves protective levels against one bar. The stop-loss wins when both are touched.
pub fn check_exit_levels(
    candle: &Candle,
    side: TradeSide,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
) -> Option<ExitTrigger> {
    let is_short = side == TradeSide::Short;
    if let Some(stop) = stop_loss {
        if let Some(price) = stop_loss_exit_price(candle, stop, is_short) {
            return Some(ExitTrigger::StopLoss(price));
        }
    }
    if let Some(target) = take_profit {
        let touched = if is_short {
            candle.low <= target
        } else {
            candle.high >= target
        };
        if touched {
            return Some(ExitTrigger::TakeProfit(target));
        }
    }
    None
}

/// Stop fill price; a bar that opens through the stop fills at the open.
pub fn stop_loss_exit_price(current_candle: &Candle, stop_loss: f64, is_short: bool) -> Option<f64> {
    if !is_short {
        if current_candle.low <= stop_loss {
            if current_candle.open <= stop_loss {
                Some(current_candle.open)
            } else {
                Some(stop_loss)
            }
        } else {
            None
        }
    } else if current_candle.high >= stop_loss {
        if current_candle.open >= stop_loss {
            Some(current_candle.open)
        } else {
            Some(stop_loss)
        }
    } else {
        None
    }
}
