use crate::error::EngineError;
use crate::filters::{create_filters, FilterConfig, SignalFilter};
use crate::models::*;
use crate::series::{CandleMap, CandleSeries};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Raw signal generator. Evaluates one bar at a time using only that bar and the ones before it.
pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;
    fn generate_signal(&self, series: &CandleSeries, candle_index: usize) -> Option<SignalType>;
    fn min_data_points(&self) -> usize;
}

#[path = "strategies/sma_crossover.rs"]
pub mod sma_crossover;

pub use sma_crossover::SmaCrossoverStrategy;

#[path = "strategies/rsi.rs"]
pub mod rsi;

pub use rsi::RsiStrategy;

#[path = "strategies/markov.rs"]
pub mod markov;

pub use markov::MarkovStrategy;

pub const STRATEGY_NAMES: [&str; 3] = ["sma_crossover", "rsi", "markov"];

pub fn create_signal_generator(
    name: &str,
    parameters: &HashMap<String, f64>,
) -> Result<Box<dyn Strategy>, EngineError> {
    match name {
        "sma_crossover" => Ok(Box::new(SmaCrossoverStrategy::new(parameters)?)),
        "rsi" => Ok(Box::new(RsiStrategy::new(parameters)?)),
        "markov" => Ok(Box::new(MarkovStrategy::new(parameters)?)),
        _ => Err(EngineError::UnknownStrategy(name.to_string())),
    }
}

/// Builds a strategy with its filter chain. Unknown names and missing filter keys fail here.
pub fn create_strategy(
    name: &str,
    parameters: &HashMap<String, f64>,
    filters: &[FilterConfig],
) -> Result<StrategyPipeline, EngineError> {
    let strategy = create_signal_generator(name, parameters)?;
    let filters = create_filters(filters)?;
    Ok(StrategyPipeline { strategy, filters })
}

/// Strategy selection as stored in JSON config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub strategy: String,
    #[serde(default)]
    pub parameters: HashMap<String, f64>,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

impl StrategyConfig {
    pub fn build(&self) -> Result<StrategyPipeline, EngineError> {
        create_strategy(&self.strategy, &self.parameters, &self.filters)
    }
}

pub struct StrategyPipeline {
    strategy: Box<dyn Strategy>,
    filters: Vec<Box<dyn SignalFilter>>,
}

impl StrategyPipeline {
    pub fn new(strategy: Box<dyn Strategy>) -> Self {
        Self {
            strategy,
            filters: Vec::new(),
        }
    }

    pub fn with_filter(mut self, filter: Box<dyn SignalFilter>) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn name(&self) -> &str {
        self.strategy.name()
    }

    pub fn filter_names(&self) -> Vec<&str> {
        self.filters.iter().map(|f| f.name()).collect()
    }

    /// Unfiltered signals for every bar of every symbol, ordered by timestamp then symbol.
    pub fn generate_signals(&self, candles: &CandleMap) -> Vec<Signal> {
        let mut symbols: Vec<&String> = candles.keys().collect();
        symbols.sort();

        let mut signals = Vec::new();
        for symbol in symbols {
            let series = &candles[symbol];
            if series.len() < self.strategy.min_data_points() {
                continue;
            }
            for (index, candle) in series.candles().iter().enumerate() {
                if let Some(signal_type) = self.strategy.generate_signal(series, index) {
                    signals.push(Signal::new(symbol, signal_type, candle.close, candle.timestamp));
                }
            }
        }

        signals.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.symbol.cmp(&b.symbol))
        });
        signals
    }

    /// Raw signals folded through every filter in registration order.
    pub fn get_filtered_signals(&self, candles: &CandleMap) -> Vec<Signal> {
        let raw = self.generate_signals(candles);
        self.filters
            .iter()
            .fold(raw, |signals, filter| filter.apply(signals, candles))
    }
}
