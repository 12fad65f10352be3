use crate::error::EngineError;
use crate::models::SignalType;
use crate::param_utils::get_param_usize;
use crate::series::CandleSeries;
use std::collections::HashMap;

pub struct SmaCrossoverStrategy {
    fast_period: usize,
    slow_period: usize,
}

impl SmaCrossoverStrategy {
    pub fn new(parameters: &HashMap<String, f64>) -> Result<Self, EngineError> {
        let fast_period = get_param_usize(parameters, "fastPeriod", 10);
        let slow_period = get_param_usize(parameters, "slowPeriod", 30);
        if fast_period == 0 {
            return Err(EngineError::invalid("fastPeriod", "must be at least 1"));
        }
        if fast_period >= slow_period {
            return Err(EngineError::invalid(
                "fastPeriod",
                format!("must be below slowPeriod ({} >= {})", fast_period, slow_period),
            ));
        }
        Ok(Self {
            fast_period,
            slow_period,
        })
    }
}

impl super::Strategy for SmaCrossoverStrategy {
    fn name(&self) -> &str {
        "sma_crossover"
    }

    fn generate_signal(&self, series: &CandleSeries, candle_index: usize) -> Option<SignalType> {
        // Both averages must be defined on the previous bar as well.
        if candle_index < self.slow_period || candle_index >= series.len() {
            return None;
        }

        let fast = series.sma(self.fast_period);
        let slow = series.sma(self.slow_period);
        let (prev_fast, prev_slow) = (fast[candle_index - 1], slow[candle_index - 1]);
        let (curr_fast, curr_slow) = (fast[candle_index], slow[candle_index]);

        if prev_fast <= prev_slow && curr_fast > curr_slow {
            Some(SignalType::Buy)
        } else if prev_fast >= prev_slow && curr_fast < curr_slow {
            Some(SignalType::Sell)
        } else {
            None
        }
    }

    fn min_data_points(&self) -> usize {
        self.slow_period + 1
    }
}
