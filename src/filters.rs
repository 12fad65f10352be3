use crate::error::EngineError;
use crate::models::{Movement, Signal, SignalType};
use crate::param_utils::{get_param_flag, require_param_f64, require_param_usize};
use crate::series::{CandleMap, CandleSeries};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One stage of the signal pipeline. A filter may drop signals or attach exit levels to them.
pub trait SignalFilter: Send + Sync {
    fn name(&self) -> &str;
    fn apply(&self, signals: Vec<Signal>, candles: &CandleMap) -> Vec<Signal>;
}

/// A filter selection as it appears in strategy config files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterConfig {
    pub name: String,
    #[serde(default)]
    pub parameters: HashMap<String, f64>,
}

impl FilterConfig {
    pub fn new(name: &str, parameters: &[(&str, f64)]) -> Self {
        Self {
            name: name.to_string(),
            parameters: parameters
                .iter()
                .map(|(key, value)| (key.to_string(), *value))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct FilterDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub required: &'static [&'static str],
    pub optional: &'static [&'static str],
}

const FILTER_CATALOG: [FilterDescriptor; 6] = [
    FilterDescriptor {
        name: "trend",
        description: "Drops signals that fight the previous bar while price sits on the wrong side of the SMA",
        required: &["period"],
        optional: &[],
    },
    FilterDescriptor {
        name: "rsi",
        description: "Keeps buys only when oversold and sells only when overbought",
        required: &["period", "oversold", "overbought"],
        optional: &[],
    },
    FilterDescriptor {
        name: "volume",
        description: "Keeps signals on bars whose volume reaches the volume SMA times a multiplier",
        required: &["period", "multiplier"],
        optional: &[],
    },
    FilterDescriptor {
        name: "atr_targets",
        description: "Sets take-profit and stop-loss at ATR multiples from the signal price",
        required: &["period", "takeProfitMultiplier", "stopLossMultiplier"],
        optional: &[],
    },
    FilterDescriptor {
        name: "take_profit_stop_loss",
        description: "Sets take-profit and stop-loss at fixed percentages from the signal price",
        required: &["takeProfitPercentage", "stopLossPercentage"],
        optional: &["useHoldStrategyForLongs"],
    },
    FilterDescriptor {
        name: "emergency_stop",
        description: "Suppresses every signal",
        required: &[],
        optional: &[],
    },
];

pub fn filter_catalog() -> &'static [FilterDescriptor] {
    &FILTER_CATALOG
}

pub fn create_filter(
    name: &str,
    params: &HashMap<String, f64>,
) -> Result<Box<dyn SignalFilter>, EngineError> {
    match name {
        "trend" => Ok(Box::new(TrendFilter {
            period: require_param_usize(params, name, "period")?,
        })),
        "rsi" => Ok(Box::new(RsiFilter {
            period: require_param_usize(params, name, "period")?,
            oversold: require_param_f64(params, name, "oversold")?,
            overbought: require_param_f64(params, name, "overbought")?,
        })),
        "volume" => Ok(Box::new(VolumeFilter {
            period: require_param_usize(params, name, "period")?,
            multiplier: require_param_f64(params, name, "multiplier")?,
        })),
        "atr_targets" => Ok(Box::new(AtrTargetsFilter {
            period: require_param_usize(params, name, "period")?,
            take_profit_multiplier: require_param_f64(params, name, "takeProfitMultiplier")?,
            stop_loss_multiplier: require_param_f64(params, name, "stopLossMultiplier")?,
        })),
        "take_profit_stop_loss" => Ok(Box::new(PercentTargetsFilter {
            take_profit_percentage: require_param_f64(params, name, "takeProfitPercentage")?,
            stop_loss_percentage: require_param_f64(params, name, "stopLossPercentage")?,
            use_hold_strategy_for_longs: get_param_flag(params, "useHoldStrategyForLongs", false),
        })),
        "emergency_stop" => Ok(Box::new(EmergencyStopFilter)),
        _ => Err(EngineError::UnknownFilter(name.to_string())),
    }
}

pub fn create_filters(configs: &[FilterConfig]) -> Result<Vec<Box<dyn SignalFilter>>, EngineError> {
    configs
        .iter()
        .map(|config| create_filter(&config.name, &config.parameters))
        .collect()
}

/// Locates the bar a signal was raised on.
fn signal_bar<'a>(signal: &Signal, candles: &'a CandleMap) -> Option<(&'a CandleSeries, usize)> {
    let series = candles.get(&signal.symbol)?;
    let index = series.index_of(signal.timestamp)?;
    Some((series, index))
}

pub struct TrendFilter {
    period: usize,
}

impl TrendFilter {
    fn keeps(&self, signal: &Signal, candles: &CandleMap) -> bool {
        let Some((series, index)) = signal_bar(signal, candles) else {
            return true;
        };
        if index == 0 {
            return true;
        }
        let sma = series.sma(self.period);
        let average = sma[index];
        if average <= 0.0 {
            return true;
        }
        let prior = series.candles()[index - 1].movement;
        match signal.signal_type {
            SignalType::Buy => !(prior == Movement::Down && signal.price < average),
            SignalType::Sell => !(prior == Movement::Up && signal.price > average),
        }
    }
}

impl SignalFilter for TrendFilter {
    fn name(&self) -> &str {
        "trend"
    }

    fn apply(&self, signals: Vec<Signal>, candles: &CandleMap) -> Vec<Signal> {
        signals
            .into_iter()
            .filter(|signal| self.keeps(signal, candles))
            .collect()
    }
}

pub struct RsiFilter {
    period: usize,
    oversold: f64,
    overbought: f64,
}

impl SignalFilter for RsiFilter {
    fn name(&self) -> &str {
        "rsi"
    }

    fn apply(&self, signals: Vec<Signal>, candles: &CandleMap) -> Vec<Signal> {
        signals
            .into_iter()
            .filter(|signal| {
                let rsi = signal_bar(signal, candles)
                    .and_then(|(series, index)| series.rsi_at(self.period, index));
                match (rsi, signal.signal_type) {
                    (Some(value), SignalType::Buy) => value <= self.oversold,
                    (Some(value), SignalType::Sell) => value >= self.overbought,
                    (None, _) => false,
                }
            })
            .collect()
    }
}

pub struct VolumeFilter {
    period: usize,
    multiplier: f64,
}

impl SignalFilter for VolumeFilter {
    fn name(&self) -> &str {
        "volume"
    }

    fn apply(&self, signals: Vec<Signal>, candles: &CandleMap) -> Vec<Signal> {
        signals
            .into_iter()
            .filter(|signal| match signal_bar(signal, candles) {
                Some((series, index)) => {
                    let average = series.volume_sma(self.period)[index];
                    series.candles()[index].volume >= average * self.multiplier
                }
                None => false,
            })
            .collect()
    }
}

pub struct AtrTargetsFilter {
    period: usize,
    take_profit_multiplier: f64,
    stop_loss_multiplier: f64,
}

impl SignalFilter for AtrTargetsFilter {
    fn name(&self) -> &str {
        "atr_targets"
    }

    fn apply(&self, mut signals: Vec<Signal>, candles: &CandleMap) -> Vec<Signal> {
        for signal in signals.iter_mut() {
            let Some((series, index)) = signal_bar(signal, candles) else {
                continue;
            };
            let atr = series.atr(self.period)[index];
            if atr <= 0.0 || !atr.is_finite() {
                continue;
            }
            let (take_profit, stop_loss) = match signal.signal_type {
                SignalType::Buy => (
                    signal.price + atr * self.take_profit_multiplier,
                    signal.price - atr * self.stop_loss_multiplier,
                ),
                SignalType::Sell => (
                    signal.price - atr * self.take_profit_multiplier,
                    signal.price + atr * self.stop_loss_multiplier,
                ),
            };
            signal.take_profit.get_or_insert(take_profit);
            signal.stop_loss.get_or_insert(stop_loss);
        }
        signals
    }
}

pub struct PercentTargetsFilter {
    take_profit_percentage: f64,
    stop_loss_percentage: f64,
    use_hold_strategy_for_longs: bool,
}

impl SignalFilter for PercentTargetsFilter {
    fn name(&self) -> &str {
        "take_profit_stop_loss"
    }

    fn apply(&self, mut signals: Vec<Signal>, _candles: &CandleMap) -> Vec<Signal> {
        let tp = self.take_profit_percentage / 100.0;
        let sl = self.stop_loss_percentage / 100.0;
        for signal in signals.iter_mut() {
            let (take_profit, stop_loss) = match signal.signal_type {
                SignalType::Buy => (signal.price * (1.0 + tp), signal.price * (1.0 - sl)),
                SignalType::Sell => (signal.price * (1.0 - tp), signal.price * (1.0 + sl)),
            };
            signal.take_profit.get_or_insert(take_profit);
            if self.use_hold_strategy_for_longs && signal.is_buy() {
                signal.stop_loss = None;
                signal.use_hold_strategy = true;
            } else {
                signal.stop_loss.get_or_insert(stop_loss);
            }
        }
        signals
    }
}

pub struct EmergencyStopFilter;

impl SignalFilter for EmergencyStopFilter {
    fn name(&self) -> &str {
        "emergency_stop"
    }

    fn apply(&self, signals: Vec<Signal>, _candles: &CandleMap) -> Vec<Signal> {
        if !signals.is_empty() {
            log::debug!("Emergency stop suppressed {} signal(s)", signals.len());
        }
        Vec::new()
    }
}
