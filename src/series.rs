use crate::indicators;
use crate::models::Candle;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;

/// Candle series keyed by symbol, as consumed by strategies and filters.
pub type CandleMap = HashMap<String, CandleSeries>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IndicatorKind {
    Sma,
    VolumeSma,
    Atr,
    Rsi,
}

/// Ordered candles for one symbol with indicator results memoized per (indicator, period).
///
/// The candles are fixed for the lifetime of the instance, so a memoized vector never goes
/// stale. Live buffers build a fresh series for every evaluation.
#[derive(Debug, Clone)]
pub struct CandleSeries {
    symbol: String,
    candles: Vec<Candle>,
    memo: DashMap<(IndicatorKind, usize), Arc<Vec<f64>>>,
}

impl CandleSeries {
    pub fn new(symbol: impl Into<String>, candles: Vec<Candle>) -> Self {
        Self {
            symbol: symbol.into(),
            candles,
            memo: DashMap::new(),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    pub fn get(&self, index: usize) -> Option<&Candle> {
        self.candles.get(index)
    }

    /// Index of the candle stamped exactly `timestamp`. A revised bar sits after the bar it
    /// revises, so the last match wins.
    pub fn index_of(&self, timestamp: DateTime<Utc>) -> Option<usize> {
        let end = self.candles.partition_point(|c| c.timestamp <= timestamp);
        let last = end.checked_sub(1)?;
        (self.candles[last].timestamp == timestamp).then_some(last)
    }

    pub fn sma(&self, period: usize) -> Arc<Vec<f64>> {
        self.indicator(IndicatorKind::Sma, period)
    }

    pub fn volume_sma(&self, period: usize) -> Arc<Vec<f64>> {
        self.indicator(IndicatorKind::VolumeSma, period)
    }

    pub fn atr(&self, period: usize) -> Arc<Vec<f64>> {
        self.indicator(IndicatorKind::Atr, period)
    }

    /// RSI values offset by `period`; see [`indicators::rsi_at`].
    pub fn rsi(&self, period: usize) -> Arc<Vec<f64>> {
        self.indicator(IndicatorKind::Rsi, period)
    }

    pub fn rsi_at(&self, period: usize, candle_index: usize) -> Option<f64> {
        indicators::rsi_at(&self.rsi(period), period, candle_index)
    }

    fn indicator(&self, kind: IndicatorKind, period: usize) -> Arc<Vec<f64>> {
        if let Some(cached) = self.memo.get(&(kind, period)) {
            return Arc::clone(cached.value());
        }
        let values = Arc::new(match kind {
            IndicatorKind::Sma => indicators::sma(&self.candles, period),
            IndicatorKind::VolumeSma => indicators::volume_sma(&self.candles, period),
            IndicatorKind::Atr => indicators::atr(&self.candles, period),
            IndicatorKind::Rsi => indicators::rsi(&self.candles, period),
        });
        self.memo.insert((kind, period), Arc::clone(&values));
        values
    }
}

/// Builds a single-symbol map, the common shape for backtests.
pub fn single_symbol_map(symbol: &str, candles: Vec<Candle>) -> CandleMap {
    HashMap::from([(symbol.to_string(), CandleSeries::new(symbol, candles))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn series() -> CandleSeries {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let candles = (0..6)
            .map(|i| {
                let close = 100.0 + i as f64;
                Candle::new(base + Duration::hours(i), close - 0.5, close + 1.0, close - 1.0, close, 10.0, 1)
            })
            .collect();
        CandleSeries::new("BTCUSDT", candles)
    }

    #[test]
    fn indicator_results_are_memoized_per_kind_and_period() {
        let s = series();
        let first = s.sma(3);
        let second = s.sma(3);
        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &s.sma(2)));
        assert!(!Arc::ptr_eq(&first, &s.volume_sma(3)));
        assert_eq!(first.len(), s.len());
    }

    #[test]
    fn index_of_finds_exact_timestamps_only() {
        let s = series();
        let ts = s.candles()[4].timestamp;
        assert_eq!(s.index_of(ts), Some(4));
        assert_eq!(s.index_of(ts + Duration::minutes(1)), None);
    }

    #[test]
    fn index_of_prefers_the_latest_revision_of_a_bar() {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let candles = vec![
            Candle::new(base, 100.0, 101.0, 99.0, 100.5, 10.0, 1),
            Candle::new(base + Duration::hours(1), 100.5, 102.0, 100.0, 101.0, 10.0, 1),
            Candle::new(base + Duration::hours(1), 100.5, 103.0, 100.0, 102.5, 14.0, 2),
            Candle::new(base + Duration::hours(2), 102.5, 104.0, 102.0, 103.0, 10.0, 1),
        ];
        let s = CandleSeries::new("BTCUSDT", candles);
        assert_eq!(s.index_of(base), Some(0));
        assert_eq!(s.index_of(base + Duration::hours(1)), Some(2));
        assert_eq!(s.index_of(base + Duration::hours(2)), Some(3));
        assert_eq!(s.index_of(base - Duration::hours(1)), None);
    }

    #[test]
    fn rsi_lookup_uses_absolute_candle_index() {
        let s = series();
        // Strictly rising closes: no losses, so every available value is 100.
        assert_eq!(s.rsi_at(3, 2), None);
        assert_eq!(s.rsi_at(3, 3), Some(100.0));
        assert_eq!(s.rsi_at(3, 5), Some(100.0));
        assert_eq!(s.rsi_at(3, 6), None);
    }
}
