use crate::config::{BacktestParameters, TradeSizing};
use crate::exchange::SharedExchange;
use crate::models::*;
use crate::performance::PerformanceCalculator;
use crate::series::single_symbol_map;
use crate::strategy::StrategyPipeline;
use crate::trading_rules::{
    apply_entry_slippage, apply_exit_slippage, check_exit_levels, determine_position_size,
    ExitTrigger, PositionSizingOutcome,
};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::HashMap;
use uuid::Uuid;

/// Replays historical candles through a strategy pipeline.
pub struct BacktestEngine {
    exchange: SharedExchange,
}

impl BacktestEngine {
    pub fn new(exchange: SharedExchange) -> Self {
        Self { exchange }
    }

    /// Validates, fetches the window once and simulates it.
    pub async fn run(
        &self,
        strategy: &StrategyPipeline,
        parameters: &BacktestParameters,
    ) -> Result<BacktestResult> {
        parameters.validate()?;
        let candles = self
            .exchange
            .get_historical_data(
                &parameters.symbol,
                parameters.timeframe,
                parameters.start_date,
                parameters.end_date,
            )
            .await
            .with_context(|| {
                format!(
                    "failed to load {} {} candles for backtest",
                    parameters.symbol, parameters.timeframe
                )
            })?;
        Self::simulate(strategy, parameters, candles)
    }

    /// Deterministic bar-by-bar simulation over already materialized candles.
    pub fn simulate(
        strategy: &StrategyPipeline,
        parameters: &BacktestParameters,
        mut candles: Vec<Candle>,
    ) -> Result<BacktestResult> {
        parameters.validate()?;
        let sizing = parameters.trade_sizing()?;
        candles.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        candles.dedup_by(|a, b| a.timestamp == b.timestamp);

        let symbol = parameters.symbol.clone();
        let candle_map = single_symbol_map(&symbol, candles);
        let series = &candle_map[&symbol];
        let mut state = SimulationState::new(parameters, sizing);

        if series.is_empty() {
            warn!(
                "No {} {} candles between {} and {}; nothing to simulate",
                symbol, parameters.timeframe, parameters.start_date, parameters.end_date
            );
            return Ok(state.finish(parameters));
        }

        let mut signals_by_time: HashMap<DateTime<Utc>, Signal> = HashMap::new();
        for signal in strategy.get_filtered_signals(&candle_map) {
            if signal.symbol != symbol {
                continue;
            }
            if signals_by_time.contains_key(&signal.timestamp) {
                debug!(
                    "Ignoring extra {} signal for {} at {}",
                    signal.signal_type.as_str(),
                    symbol,
                    signal.timestamp
                );
                continue;
            }
            signals_by_time.insert(signal.timestamp, signal);
        }
        info!(
            "Backtesting {} on {} {}: {} candles, {} filtered signals",
            strategy.name(),
            symbol,
            parameters.timeframe,
            series.len(),
            signals_by_time.len()
        );

        let last_index = series.len() - 1;
        for (index, candle) in series.candles().iter().enumerate() {
            state.resolve_exit_levels(candle);

            if index == last_index {
                break;
            }
            if let Some(signal) = signals_by_time.get(&candle.timestamp) {
                state.handle_signal(signal, candle);
            }
        }

        if let Some(last) = series.last() {
            state.liquidate(last);
        }
        Ok(state.finish(parameters))
    }
}

struct SimulationState {
    capital: f64,
    sizing: TradeSizing,
    commission_rate: f64,
    slippage_rate: f64,
    allow_short_selling: bool,
    open: Option<Trade>,
    trade_history: Vec<Trade>,
    held_assets: Vec<HeldAsset>,
    equity_curve: Vec<f64>,
    win_count: usize,
    loss_count: usize,
    hold_count: usize,
}

impl SimulationState {
    fn new(parameters: &BacktestParameters, sizing: TradeSizing) -> Self {
        Self {
            capital: parameters.initial_capital,
            sizing,
            commission_rate: parameters.commission_rate(),
            slippage_rate: parameters.slippage_rate(),
            allow_short_selling: parameters.allow_short_selling,
            open: None,
            trade_history: Vec::new(),
            held_assets: Vec::new(),
            equity_curve: vec![parameters.initial_capital],
            win_count: 0,
            loss_count: 0,
            hold_count: 0,
        }
    }

    fn resolve_exit_levels(&mut self, candle: &Candle) {
        let Some(trade) = self.open.as_ref() else {
            return;
        };
        let Some(trigger) = check_exit_levels(candle, trade.side, trade.stop_loss, trade.take_profit)
        else {
            return;
        };
        let outcome = match trigger {
            ExitTrigger::StopLoss(_) => TradeOutcome::StopLoss,
            ExitTrigger::TakeProfit(_) => TradeOutcome::TakeProfit,
        };
        self.close_open(trigger.price(), candle.timestamp, outcome);
    }

    fn handle_signal(&mut self, signal: &Signal, candle: &Candle) {
        if let Some(trade) = self.open.as_ref() {
            if signal.signal_type == trade.side.closing_signal() {
                // Closing never reopens on the same bar.
                self.close_open(signal.price, candle.timestamp, TradeOutcome::Closed);
            } else {
                debug!(
                    "Ignoring {} signal at {}: position already open",
                    signal.signal_type.as_str(),
                    signal.timestamp
                );
            }
            return;
        }

        let side = TradeSide::for_entry(signal.signal_type);
        if side == TradeSide::Short && !self.allow_short_selling {
            return;
        }
        self.open_position(signal, side);
    }

    fn open_position(&mut self, signal: &Signal, side: TradeSide) {
        let fill_price = apply_entry_slippage(signal.price, side, self.slippage_rate);
        let allocation = match determine_position_size(
            &self.sizing,
            self.capital,
            fill_price,
            self.commission_rate,
        ) {
            PositionSizingOutcome::Sized(allocation) => allocation,
            PositionSizingOutcome::TooSmall => {
                debug!("Skipping entry at {}: trade too small", signal.timestamp);
                return;
            }
            PositionSizingOutcome::InsufficientCapital { available } => {
                debug!(
                    "Skipping entry at {}: capital {:.2} below minimum",
                    signal.timestamp, available
                );
                return;
            }
        };

        self.capital -= allocation.amount + allocation.commission;
        let use_hold_strategy = signal.use_hold_strategy && side == TradeSide::Long;
        self.open = Some(Trade {
            id: Uuid::new_v4().to_string(),
            symbol: signal.symbol.clone(),
            side,
            quantity: allocation.quantity,
            entry_price: fill_price,
            entry_timestamp: signal.timestamp,
            exit_price: None,
            exit_timestamp: None,
            stop_loss: if use_hold_strategy { None } else { signal.stop_loss },
            take_profit: signal.take_profit,
            amount_invested: allocation.amount,
            entry_commission: allocation.commission,
            exit_commission: 0.0,
            pnl: 0.0,
            use_hold_strategy,
            outcome: None,
        });
    }

    /// Settles the open position at `price` before slippage; returns the net exit proceeds.
    fn settle(&mut self, price: f64, timestamp: DateTime<Utc>, outcome: TradeOutcome) -> Option<Trade> {
        let mut trade = self.open.take()?;
        let exit_price = apply_exit_slippage(price, trade.side, self.slippage_rate);
        let exit_value = trade.quantity * exit_price;
        let exit_commission = exit_value * self.commission_rate;
        let gross = trade.side.direction() * (exit_value - trade.entry_value());

        self.capital += trade.amount_invested + gross - exit_commission;
        trade.exit_price = Some(exit_price);
        trade.exit_timestamp = Some(timestamp);
        trade.exit_commission = exit_commission;
        trade.pnl = gross - trade.entry_commission - exit_commission;
        trade.outcome = Some(outcome);
        Some(trade)
    }

    fn close_open(&mut self, price: f64, timestamp: DateTime<Utc>, outcome: TradeOutcome) {
        let Some(trade) = self.settle(price, timestamp, outcome) else {
            return;
        };
        if trade.pnl > 0.0 {
            self.win_count += 1;
        } else {
            self.loss_count += 1;
        }
        debug!(
            "Closed {:?} {} at {:.4} ({}), pnl {:.2}",
            trade.side,
            trade.symbol,
            trade.exit_price.unwrap_or(price),
            outcome.as_str(),
            trade.pnl
        );
        self.trade_history.push(trade);
        self.equity_curve.push(self.capital);
    }

    fn liquidate(&mut self, last: &Candle) {
        let Some(trade) = self.open.as_ref() else {
            return;
        };
        if !(trade.use_hold_strategy && trade.side == TradeSide::Long) {
            self.close_open(last.close, last.timestamp, TradeOutcome::Closed);
            return;
        }

        let Some(trade) = self.settle(last.close, last.timestamp, TradeOutcome::MovedToHold) else {
            return;
        };
        let market_price = trade.exit_price.unwrap_or(last.close);
        self.held_assets.push(HeldAsset {
            symbol: trade.symbol.clone(),
            quantity: trade.quantity,
            entry_price: trade.entry_price,
            entry_timestamp: trade.entry_timestamp,
            market_price,
            market_value: trade.quantity * market_price - trade.exit_commission,
            unrealized_pnl: trade.pnl,
        });
        self.hold_count += 1;
        self.trade_history.push(trade);
        self.equity_curve.push(self.capital);
    }

    fn finish(self, parameters: &BacktestParameters) -> BacktestResult {
        let realized_pnl = self
            .trade_history
            .iter()
            .filter(|t| t.outcome != Some(TradeOutcome::MovedToHold))
            .map(|t| t.pnl)
            .sum();
        let performance = PerformanceCalculator::summarize(
            &self.trade_history,
            parameters.initial_capital,
            self.capital,
            &self.equity_curve,
        );
        info!(
            "Backtest {} finished: capital {:.2} -> {:.2}, {} wins, {} losses, {} held",
            parameters.symbol,
            parameters.initial_capital,
            self.capital,
            self.win_count,
            self.loss_count,
            self.hold_count
        );

        BacktestResult {
            symbol: parameters.symbol.clone(),
            timeframe: parameters.timeframe,
            start_date: parameters.start_date,
            end_date: parameters.end_date,
            starting_capital: parameters.initial_capital,
            final_capital: self.capital,
            realized_pnl,
            win_count: self.win_count,
            loss_count: self.loss_count,
            hold_count: self.hold_count,
            trade_history: self.trade_history,
            held_assets: self.held_assets,
            performance,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TradeSizeMode, Timeframe};
    use crate::filters::create_filter;
    use crate::series::CandleSeries;
    use crate::strategy::Strategy;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    struct Scripted {
        actions: HashMap<usize, SignalType>,
    }

    impl Strategy for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        fn generate_signal(&self, _series: &CandleSeries, candle_index: usize) -> Option<SignalType> {
            self.actions.get(&candle_index).copied()
        }

        fn min_data_points(&self) -> usize {
            1
        }
    }

    fn scripted(actions: &[(usize, SignalType)]) -> StrategyPipeline {
        StrategyPipeline::new(Box::new(Scripted {
            actions: actions.iter().copied().collect(),
        }))
    }

    fn create_date(days_offset: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(days_offset)
    }

    /// (open, high, low, close) rows on consecutive days.
    fn generate_candles(rows: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
        rows.iter()
            .enumerate()
            .map(|(i, &(o, h, l, c))| Candle::new(create_date(i as i64), o, h, l, c, 1_000.0, 10))
            .collect()
    }

    fn flat_candles(closes: &[f64]) -> Vec<Candle> {
        let rows: Vec<_> = closes
            .iter()
            .map(|&c| (c, c * 1.01, c * 0.99, c))
            .collect();
        generate_candles(&rows)
    }

    fn parameters(mode: TradeSizeMode, value: f64) -> BacktestParameters {
        BacktestParameters {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::OneDay,
            start_date: create_date(0),
            end_date: create_date(30),
            initial_capital: 10_000.0,
            trade_size_mode: Some(mode),
            trade_size_value: value,
            commission_percentage: 0.0,
            slippage_percentage: 0.0,
            allow_short_selling: false,
        }
    }

    #[test]
    fn test_end_to_end_percentage_sizing() {
        let _ = env_logger::builder().is_test(true).try_init();
        let candles = flat_candles(&[100.0, 100.0, 105.0, 110.0, 108.0]);
        let strategy = scripted(&[(1, SignalType::Buy), (3, SignalType::Sell)]);
        let params = parameters(TradeSizeMode::PercentageOfCapital, 10.0);

        let result = BacktestEngine::simulate(&strategy, &params, candles).unwrap();

        // 1000 at 100 buys 10 units; selling at 110 earns 10 * 10.
        assert_eq!(result.trade_history.len(), 1);
        let trade = &result.trade_history[0];
        assert_relative_eq!(trade.quantity, 10.0);
        assert_relative_eq!(trade.pnl, 100.0);
        assert_eq!(trade.outcome, Some(TradeOutcome::Closed));
        assert_relative_eq!(result.final_capital, 10_100.0);
        assert_relative_eq!(result.realized_pnl, 100.0);
        assert_eq!((result.win_count, result.loss_count, result.hold_count), (1, 0, 0));
        assert_eq!(result.performance.total_trades, 1);
    }

    #[test]
    fn test_signal_on_last_candle_is_never_acted_on() {
        let candles = flat_candles(&[100.0, 101.0, 102.0]);
        let strategy = scripted(&[(2, SignalType::Buy)]);
        let result = BacktestEngine::simulate(
            &strategy,
            &parameters(TradeSizeMode::FixedAmount, 1_000.0),
            candles,
        )
        .unwrap();
        assert!(result.trade_history.is_empty());
        assert_eq!(result.final_capital, 10_000.0);
    }

    #[test]
    fn test_slippage_and_commission_arithmetic() {
        let candles = flat_candles(&[100.0, 100.0, 110.0, 110.0]);
        let strategy = scripted(&[(1, SignalType::Buy), (2, SignalType::Sell)]);
        let mut params = parameters(TradeSizeMode::FixedAmount, 1_000.0);
        params.commission_percentage = 0.1;
        params.slippage_percentage = 1.0;

        let result = BacktestEngine::simulate(&strategy, &params, candles).unwrap();
        let trade = &result.trade_history[0];

        let entry_price = 100.0 * 1.01;
        let quantity = 1_000.0 / entry_price;
        let entry_commission = 1_000.0 * 0.001;
        let exit_price = 110.0 * 0.99;
        let exit_value = quantity * exit_price;
        let exit_commission = exit_value * 0.001;
        let expected_pnl = exit_value - 1_000.0 - entry_commission - exit_commission;

        assert_relative_eq!(trade.entry_price, entry_price, epsilon = 1e-9);
        assert_relative_eq!(trade.exit_price.unwrap(), exit_price, epsilon = 1e-9);
        assert_relative_eq!(trade.entry_commission, entry_commission, epsilon = 1e-9);
        assert_relative_eq!(trade.exit_commission, exit_commission, epsilon = 1e-9);
        assert_relative_eq!(trade.pnl, expected_pnl, epsilon = 1e-9);
        assert_relative_eq!(result.final_capital, 10_000.0 + expected_pnl, epsilon = 1e-9);
    }

    #[test]
    fn test_stop_loss_wins_when_bar_touches_both_levels() {
        let candles = generate_candles(&[
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 112.0, 94.0, 105.0),
            (105.0, 106.0, 104.0, 105.0),
        ]);
        let params: HashMap<String, f64> = HashMap::from([
            ("takeProfitPercentage".to_string(), 10.0),
            ("stopLossPercentage".to_string(), 5.0),
        ]);
        let strategy = scripted(&[(1, SignalType::Buy)])
            .with_filter(create_filter("take_profit_stop_loss", &params).unwrap());

        let result = BacktestEngine::simulate(
            &strategy,
            &parameters(TradeSizeMode::FixedAmount, 1_000.0),
            candles,
        )
        .unwrap();

        assert_eq!(result.trade_history.len(), 1);
        let trade = &result.trade_history[0];
        assert_eq!(trade.outcome, Some(TradeOutcome::StopLoss));
        assert_relative_eq!(trade.exit_price.unwrap(), 95.0, epsilon = 1e-9);
        assert_eq!(trade.exit_timestamp, Some(create_date(2)));
        assert_relative_eq!(trade.pnl, -50.0, epsilon = 1e-9);
        assert_eq!(result.loss_count, 1);
    }

    #[test]
    fn test_take_profit_exit() {
        let candles = generate_candles(&[
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 101.0, 99.0, 100.0),
            (100.0, 111.0, 99.0, 108.0),
            (108.0, 109.0, 107.0, 108.0),
        ]);
        let params: HashMap<String, f64> = HashMap::from([
            ("takeProfitPercentage".to_string(), 10.0),
            ("stopLossPercentage".to_string(), 5.0),
        ]);
        let strategy = scripted(&[(1, SignalType::Buy)])
            .with_filter(create_filter("take_profit_stop_loss", &params).unwrap());
        let result = BacktestEngine::simulate(
            &strategy,
            &parameters(TradeSizeMode::FixedAmount, 1_000.0),
            candles,
        )
        .unwrap();
        let trade = &result.trade_history[0];
        assert_eq!(trade.outcome, Some(TradeOutcome::TakeProfit));
        assert_relative_eq!(trade.pnl, 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_no_pyramiding_and_no_reentry_on_closing_bar() {
        let candles = flat_candles(&[100.0, 100.0, 102.0, 104.0, 104.0, 104.0]);
        let strategy = scripted(&[
            (1, SignalType::Buy),
            (2, SignalType::Buy),
            (3, SignalType::Sell),
        ]);
        let mut params = parameters(TradeSizeMode::FixedAmount, 1_000.0);
        params.allow_short_selling = true;

        let result = BacktestEngine::simulate(&strategy, &params, candles).unwrap();

        // One long, opened once; the closing sell does not flip into a short.
        assert_eq!(result.trade_history.len(), 1);
        assert_eq!(result.trade_history[0].side, TradeSide::Long);
        assert_relative_eq!(result.trade_history[0].quantity, 10.0);
        assert_relative_eq!(result.final_capital, 10_040.0);
    }

    #[test]
    fn test_short_selling_requires_opt_in() {
        let candles = flat_candles(&[100.0, 100.0, 90.0, 90.0]);
        let strategy = scripted(&[(1, SignalType::Sell), (2, SignalType::Buy)]);

        let long_only = BacktestEngine::simulate(
            &strategy,
            &parameters(TradeSizeMode::FixedAmount, 1_000.0),
            candles.clone(),
        )
        .unwrap();
        // The buy on bar 2 opens a long that is liquidated flat at the end.
        assert_eq!(long_only.trade_history.len(), 1);
        assert_eq!(long_only.trade_history[0].side, TradeSide::Long);

        let mut params = parameters(TradeSizeMode::FixedAmount, 1_000.0);
        params.allow_short_selling = true;
        let with_shorts = BacktestEngine::simulate(&strategy, &params, candles).unwrap();
        let short = &with_shorts.trade_history[0];
        assert_eq!(short.side, TradeSide::Short);
        assert_relative_eq!(short.pnl, 100.0, epsilon = 1e-9);
        assert_relative_eq!(with_shorts.final_capital, 10_100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_open_positions_are_liquidated_or_held_at_the_end() {
        let candles = flat_candles(&[100.0, 100.0, 120.0]);
        let strategy = scripted(&[(1, SignalType::Buy)]);
        let result = BacktestEngine::simulate(
            &strategy,
            &parameters(TradeSizeMode::FixedAmount, 1_000.0),
            candles.clone(),
        )
        .unwrap();
        assert_eq!(result.trade_history[0].outcome, Some(TradeOutcome::Closed));
        assert!(result.held_assets.is_empty());
        assert_relative_eq!(result.final_capital, 10_200.0, epsilon = 1e-9);

        let hold_params: HashMap<String, f64> = HashMap::from([
            ("takeProfitPercentage".to_string(), 50.0),
            ("stopLossPercentage".to_string(), 5.0),
            ("useHoldStrategyForLongs".to_string(), 1.0),
        ]);
        let holding = scripted(&[(1, SignalType::Buy)])
            .with_filter(create_filter("take_profit_stop_loss", &hold_params).unwrap());
        let result = BacktestEngine::simulate(
            &holding,
            &parameters(TradeSizeMode::FixedAmount, 1_000.0),
            candles,
        )
        .unwrap();
        assert_eq!(result.hold_count, 1);
        assert_eq!(result.held_assets.len(), 1);
        assert_relative_eq!(result.held_assets[0].market_value, 1_200.0, epsilon = 1e-9);
        assert_eq!(result.trade_history[0].outcome, Some(TradeOutcome::MovedToHold));
        assert_eq!(result.trade_history[0].stop_loss, None);
        assert_eq!(result.realized_pnl, 0.0);
        assert_eq!((result.win_count, result.loss_count), (0, 0));
        assert_relative_eq!(result.final_capital, 10_200.0, epsilon = 1e-9);
    }

    #[test]
    fn test_capital_is_never_overdrawn() {
        let candles = flat_candles(&[100.0, 100.0, 100.0]);
        let strategy = scripted(&[(1, SignalType::Buy)]);
        let mut params = parameters(TradeSizeMode::FixedAmount, 50_000.0);
        params.commission_percentage = 1.0;

        let result = BacktestEngine::simulate(&strategy, &params, candles).unwrap();
        let trade = &result.trade_history[0];
        assert_relative_eq!(
            trade.amount_invested + trade.entry_commission,
            10_000.0,
            epsilon = 1e-6
        );
        assert!(result.final_capital >= 0.0);
    }

    #[test]
    fn test_invalid_parameters_fail_before_simulation() {
        let strategy = scripted(&[]);
        let mut params = parameters(TradeSizeMode::PercentageOfCapital, 150.0);
        assert!(BacktestEngine::simulate(&strategy, &params, Vec::new()).is_err());
        params.trade_size_value = 10.0;
        params.initial_capital = 0.0;
        assert!(BacktestEngine::simulate(&strategy, &params, Vec::new()).is_err());
    }
}
