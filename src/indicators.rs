use crate::models::Candle;

pub fn calculate_sma(values: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || values.len() < period {
        return vec![0.0; values.len()];
    }
    if period == 1 {
        return values.to_vec();
    }

    let mut sma_values = vec![0.0; period - 1];
    sma_values.reserve(values.len() + 1 - period);

    let mut window_sum: f64 = values[..period].iter().sum();
    sma_values.push(window_sum / period as f64);
    for i in period..values.len() {
        window_sum += values[i] - values[i - period];
        sma_values.push(window_sum / period as f64);
    }

    sma_values
}

/// Simple moving average of closes, zero-filled before the first full window.
pub fn sma(candles: &[Candle], period: usize) -> Vec<f64> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    calculate_sma(&closes, period)
}

/// Simple moving average of volume, zero-filled before the first full window.
pub fn volume_sma(candles: &[Candle], period: usize) -> Vec<f64> {
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume).collect();
    calculate_sma(&volumes, period)
}

pub fn true_ranges(candles: &[Candle]) -> Vec<f64> {
    let mut tr_values = Vec::with_capacity(candles.len());
    for (i, candle) in candles.iter().enumerate() {
        let range = candle.high - candle.low;
        let tr = if i == 0 {
            range
        } else {
            let prev_close = candles[i - 1].close;
            range
                .max((candle.high - prev_close).abs())
                .max((candle.low - prev_close).abs())
        };
        tr_values.push(tr);
    }
    tr_values
}

/// Average true range with Wilder smoothing, aligned to the candle index.
pub fn atr(candles: &[Candle], period: usize) -> Vec<f64> {
    if period == 0 || candles.len() < period {
        return vec![0.0; candles.len()];
    }

    let tr_values = true_ranges(candles);
    let mut atr_values = vec![0.0; candles.len()];
    let mut current = tr_values[..period].iter().sum::<f64>() / period as f64;
    atr_values[period - 1] = current;

    for i in period..tr_values.len() {
        current = (current * (period as f64 - 1.0) + tr_values[i]) / period as f64;
        atr_values[i] = current;
    }

    atr_values
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// Wilder RSI over closes.
///
/// The result has `len - period` entries: element `k` belongs to candle index `k + period`.
/// A zero period yields a zero-filled vector of the input length and a series too short to
/// seed yields an empty vector.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 {
        return vec![0.0; closes.len()];
    }
    if closes.len() <= period {
        return Vec::new();
    }

    let mut sum_gain = 0.0f64;
    let mut sum_loss = 0.0f64;
    for i in 1..=period {
        let delta = closes[i] - closes[i - 1];
        if delta >= 0.0 {
            sum_gain += delta;
        } else {
            sum_loss += -delta;
        }
    }

    let mut avg_gain = sum_gain / period as f64;
    let mut avg_loss = sum_loss / period as f64;
    let mut rsi_values = Vec::with_capacity(closes.len() - period);
    rsi_values.push(rsi_from_avgs(avg_gain, avg_loss));

    for i in (period + 1)..closes.len() {
        let delta = closes[i] - closes[i - 1];
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { -delta } else { 0.0 };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        rsi_values.push(rsi_from_avgs(avg_gain, avg_loss));
    }

    rsi_values
}

pub fn rsi(candles: &[Candle], period: usize) -> Vec<f64> {
    let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
    calculate_rsi(&closes, period)
}

/// Looks up the RSI value belonging to an absolute candle index.
pub fn rsi_at(rsi_values: &[f64], period: usize, candle_index: usize) -> Option<f64> {
    if period == 0 || candle_index < period {
        return None;
    }
    rsi_values.get(candle_index - period).copied()
}
