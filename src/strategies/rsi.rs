use crate::error::EngineError;
use crate::models::SignalType;
use crate::param_utils::{get_param_f64, get_param_usize};
use crate::series::CandleSeries;
use std::collections::HashMap;

pub struct RsiStrategy {
    period: usize,
    oversold_level: f64,
    overbought_level: f64,
}

impl RsiStrategy {
    pub fn new(parameters: &HashMap<String, f64>) -> Result<Self, EngineError> {
        let period = get_param_usize(parameters, "period", 14);
        let oversold_level = get_param_f64(parameters, "oversoldLevel", 30.0);
        let overbought_level = get_param_f64(parameters, "overboughtLevel", 70.0);
        if period == 0 {
            return Err(EngineError::invalid("period", "must be at least 1"));
        }
        if oversold_level >= overbought_level {
            return Err(EngineError::invalid(
                "oversoldLevel",
                format!(
                    "must be below overboughtLevel ({} >= {})",
                    oversold_level, overbought_level
                ),
            ));
        }
        Ok(Self {
            period,
            oversold_level,
            overbought_level,
        })
    }
}

impl super::Strategy for RsiStrategy {
    fn name(&self) -> &str {
        "rsi"
    }

    fn generate_signal(&self, series: &CandleSeries, candle_index: usize) -> Option<SignalType> {
        let current_rsi = series.rsi_at(self.period, candle_index)?;

        // Buy signal: RSI is oversold
        if current_rsi < self.oversold_level {
            return Some(SignalType::Buy);
        }

        // Sell signal: RSI is overbought
        if current_rsi > self.overbought_level {
            return Some(SignalType::Sell);
        }

        None
    }

    fn min_data_points(&self) -> usize {
        self.period + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Candle;
    use crate::strategy::Strategy;
    use chrono::{Duration, TimeZone, Utc};

    fn series_from_closes(closes: &[f64]) -> CandleSeries {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let candles = closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle::new(base + Duration::days(i as i64), c, c, c, c, 1.0, 1))
            .collect();
        CandleSeries::new("BTCUSDT", candles)
    }

    #[test]
    fn signals_follow_oversold_and_overbought_levels() {
        let params = HashMap::from([("period".to_string(), 3.0)]);
        let strategy = RsiStrategy::new(&params).unwrap();

        let rising = series_from_closes(&[10.0, 11.0, 12.0, 13.0, 14.0]);
        assert_eq!(strategy.generate_signal(&rising, 2), None);
        assert_eq!(strategy.generate_signal(&rising, 4), Some(SignalType::Sell));

        let falling = series_from_closes(&[14.0, 13.0, 12.0, 11.0, 10.0]);
        assert_eq!(strategy.generate_signal(&falling, 4), Some(SignalType::Buy));
    }

    #[test]
    fn inverted_levels_are_rejected() {
        let params = HashMap::from([
            ("oversoldLevel".to_string(), 80.0),
            ("overboughtLevel".to_string(), 20.0),
        ]);
        assert!(RsiStrategy::new(&params).is_err());
    }
}
