use crate::models::*;
use statrs::statistics::Statistics;

pub struct PerformanceCalculator;

#[derive(Debug, Clone, Copy, PartialEq)]
struct DrawdownInfo {
    max_drawdown: f64,
    max_drawdown_percent: f64,
}

impl PerformanceCalculator {
    /// Summarizes realized trades. `equity_curve` is the cash balance after each closed
    /// trade, starting with the initial capital.
    pub fn summarize(
        trades: &[Trade],
        initial_capital: f64,
        final_capital: f64,
        equity_curve: &[f64],
    ) -> PerformanceSummary {
        let trade_pnls: Vec<f64> = trades
            .iter()
            .filter(|t| t.outcome.is_some() && t.outcome != Some(TradeOutcome::MovedToHold))
            .map(|t| t.pnl)
            .filter(|pnl| pnl.is_finite())
            .collect();
        let total_trades = trade_pnls.len();
        let winning_trades = trade_pnls.iter().filter(|pnl| **pnl > 0.0).count();
        let win_rate = if total_trades > 0 {
            winning_trades as f64 / total_trades as f64
        } else {
            0.0
        };

        let total_return = if final_capital.is_finite() {
            final_capital - initial_capital
        } else {
            0.0
        };
        let total_return_percent = if initial_capital > 0.0 {
            total_return / initial_capital * 100.0
        } else {
            0.0
        };

        let (avg_trade_pnl, best_trade, worst_trade) = if trade_pnls.is_empty() {
            (0.0, 0.0, 0.0)
        } else {
            (
                trade_pnls.iter().mean(),
                trade_pnls.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                trade_pnls.iter().copied().fold(f64::INFINITY, f64::min),
            )
        };

        // Sample standard deviation is undefined below two trades.
        let trade_pnl_std_dev = if trade_pnls.len() < 2 {
            0.0
        } else {
            trade_pnls.iter().std_dev()
        };

        let drawdown = Self::calculate_max_drawdown(equity_curve);

        PerformanceSummary {
            total_trades,
            total_return,
            total_return_percent,
            win_rate,
            avg_trade_pnl,
            best_trade,
            worst_trade,
            trade_pnl_std_dev,
            max_drawdown: drawdown.max_drawdown,
            max_drawdown_percent: drawdown.max_drawdown_percent,
        }
    }

    fn calculate_max_drawdown(equity_curve: &[f64]) -> DrawdownInfo {
        let mut max_drawdown = 0.0;
        let mut max_drawdown_percent = 0.0;
        let Some(first) = equity_curve.first() else {
            return DrawdownInfo {
                max_drawdown,
                max_drawdown_percent,
            };
        };
        let mut peak_value = *first;

        for value in equity_curve.iter().copied().filter(|v| v.is_finite()) {
            if value > peak_value {
                peak_value = value;
            } else {
                let drawdown = peak_value - value;
                let drawdown_percent = if peak_value > 0.0 {
                    (drawdown / peak_value) * 100.0
                } else {
                    0.0
                };

                if drawdown > max_drawdown {
                    max_drawdown = drawdown;
                }
                if drawdown_percent > max_drawdown_percent {
                    max_drawdown_percent = drawdown_percent;
                }
            }
        }

        DrawdownInfo {
            max_drawdown,
            max_drawdown_percent,
        }
    }
}
