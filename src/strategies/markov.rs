use crate::analytics::markov_probability;
use crate::error::EngineError;
use crate::models::{Movement, SignalType};
use crate::param_utils::{get_param_f64, get_param_usize};
use crate::series::CandleSeries;
use std::collections::HashMap;

/// Trades the empirical probability that the latest movement pattern is followed by an up bar.
pub struct MarkovStrategy {
    pattern_length: usize,
    lookback: usize,
    threshold: f64,
}

impl MarkovStrategy {
    pub fn new(parameters: &HashMap<String, f64>) -> Result<Self, EngineError> {
        let pattern_length = get_param_usize(parameters, "patternLength", 3);
        let lookback = get_param_usize(parameters, "lookback", 200);
        let threshold = get_param_f64(parameters, "threshold", 0.6);
        if pattern_length == 0 {
            return Err(EngineError::invalid("patternLength", "must be at least 1"));
        }
        if lookback <= pattern_length {
            return Err(EngineError::invalid(
                "lookback",
                format!("must exceed patternLength ({} <= {})", lookback, pattern_length),
            ));
        }
        if threshold <= 0.5 || threshold > 1.0 {
            return Err(EngineError::invalid(
                "threshold",
                format!("must be within (0.5, 1] (value: {})", threshold),
            ));
        }
        Ok(Self {
            pattern_length,
            lookback,
            threshold,
        })
    }
}

impl super::Strategy for MarkovStrategy {
    fn name(&self) -> &str {
        "markov"
    }

    fn generate_signal(&self, series: &CandleSeries, candle_index: usize) -> Option<SignalType> {
        if candle_index < self.pattern_length || candle_index >= series.len() {
            return None;
        }

        let start = (candle_index + 1).saturating_sub(self.lookback);
        let history: Vec<Movement> = series.candles()[start..=candle_index]
            .iter()
            .map(|c| c.movement)
            .collect();
        let pattern = &history[history.len() - self.pattern_length..];
        let probability = markov_probability(&history, pattern, Movement::Up);

        if probability >= self.threshold {
            Some(SignalType::Buy)
        } else if probability <= 1.0 - self.threshold {
            Some(SignalType::Sell)
        } else {
            None
        }
    }

    fn min_data_points(&self) -> usize {
        self.pattern_length + 2
    }
}
