use crate::models::{Candle, Movement};
use chrono::{DateTime, Utc};

/// Merges freshly fetched candles into a buffer.
///
/// Candles equal in every field to one already buffered are skipped; the buffer stays
/// sorted by timestamp. A refetched bar with new values is kept next to the old one, and the
/// stable sort puts it after, so lookups by timestamp should take the last match.
/// Returns the number of candles actually added.
pub fn merge_candles(buffer: &mut Vec<Candle>, incoming: Vec<Candle>) -> usize {
    let before = buffer.len();
    for candle in incoming {
        if !buffer.iter().rev().any(|existing| existing == &candle) {
            buffer.push(candle);
        }
    }
    let added = buffer.len() - before;
    if added > 0 {
        buffer.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    }
    added
}

/// Up/Down sequence of a candle series.
pub fn movements(candles: &[Candle]) -> Vec<Movement> {
    candles.iter().map(|c| c.movement).collect()
}

/// Keeps the candles inside `[from, to]`, preserving order.
pub fn candles_in_range(candles: &[Candle], from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<Candle> {
    candles
        .iter()
        .filter(|c| c.timestamp >= from && c.timestamp <= to)
        .cloned()
        .collect()
}

pub fn last_timestamp(candles: &[Candle]) -> Option<DateTime<Utc>> {
    candles.last().map(|c| c.timestamp)
}

/// Normalizes a symbol string by trimming whitespace and uppercasing.
pub fn normalize_symbol(value: &str) -> Option<String> {
    let normalized = value.trim().to_uppercase();
    if normalized.is_empty() {
        None
    } else {
        Some(normalized)
    }
}
