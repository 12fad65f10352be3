use crate::error::EngineError;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

const SETTING_PREFIXES: [&str; 7] = [
    "BINANCE_", "CANDLE_", "PAPER_", "TRADING_", "TRADE_", "QUOTE_", "HISTORY_",
];
const DEFAULT_BINANCE_BASE_URL: &str = "https://api.binance.com";
const DEFAULT_CACHE_DIR: &str = ".cache/candles";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_HISTORY_LOOKBACK_DAYS: i64 = 100;
const DEFAULT_QUOTE_ASSET: &str = "USDT";
const DEFAULT_PAPER_QUOTE_BALANCE: f64 = 10_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Timeframe {
    OneMinute,
    FiveMinutes,
    FifteenMinutes,
    ThirtyMinutes,
    OneHour,
    FourHours,
    OneDay,
    OneWeek,
}

impl Timeframe {
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneMinute => "1m",
            Timeframe::FiveMinutes => "5m",
            Timeframe::FifteenMinutes => "15m",
            Timeframe::ThirtyMinutes => "30m",
            Timeframe::OneHour => "1h",
            Timeframe::FourHours => "4h",
            Timeframe::OneDay => "1d",
            Timeframe::OneWeek => "1w",
        }
    }
}

impl FromStr for Timeframe {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "1m" | "1min" | "minute" => Ok(Timeframe::OneMinute),
            "5m" | "5min" => Ok(Timeframe::FiveMinutes),
            "15m" | "15min" => Ok(Timeframe::FifteenMinutes),
            "30m" | "30min" => Ok(Timeframe::ThirtyMinutes),
            "1h" | "hour" | "hourly" => Ok(Timeframe::OneHour),
            "4h" => Ok(Timeframe::FourHours),
            "1d" | "day" | "daily" => Ok(Timeframe::OneDay),
            "1w" | "week" | "weekly" => Ok(Timeframe::OneWeek),
            _ => Err(EngineError::InvalidTimeframe(s.to_string())),
        }
    }
}

impl TryFrom<String> for Timeframe {
    type Error = EngineError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Timeframe> for String {
    fn from(value: Timeframe) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TradeSizeMode {
    FixedAmount,
    PercentageOfCapital,
}

impl FromStr for TradeSizeMode {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" | "fixed_amount" | "fixedamount" => Ok(TradeSizeMode::FixedAmount),
            "percent" | "percentage" | "percentage_of_capital" | "percentageofcapital" => {
                Ok(TradeSizeMode::PercentageOfCapital)
            }
            other => Err(EngineError::invalid(
                "tradeSizeMode",
                format!("expected fixed or percentage, got '{}'", other),
            )),
        }
    }
}

/// Trade sizing rule shared by the backtest and live engines.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TradeSizing {
    pub mode: TradeSizeMode,
    pub value: f64,
}

impl TradeSizing {
    pub fn new(mode: TradeSizeMode, value: f64) -> Result<Self, EngineError> {
        if !value.is_finite() || value <= 0.0 {
            return Err(EngineError::invalid(
                "tradeSizeValue",
                format!("must be a positive number (value: {})", value),
            ));
        }
        if mode == TradeSizeMode::PercentageOfCapital && value > 100.0 {
            return Err(EngineError::invalid(
                "tradeSizeValue",
                format!("percentage of capital must be <= 100 (value: {})", value),
            ));
        }
        Ok(Self { mode, value })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestParameters {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub initial_capital: f64,
    #[serde(default)]
    pub trade_size_mode: Option<TradeSizeMode>,
    pub trade_size_value: f64,
    #[serde(default)]
    pub commission_percentage: f64,
    #[serde(default)]
    pub slippage_percentage: f64,
    #[serde(default)]
    pub allow_short_selling: bool,
}

impl BacktestParameters {
    pub fn trade_sizing(&self) -> Result<TradeSizing, EngineError> {
        let mode = self
            .trade_size_mode
            .ok_or_else(|| EngineError::missing("backtest parameters", "tradeSizeMode"))?;
        TradeSizing::new(mode, self.trade_size_value)
    }

    pub fn commission_rate(&self) -> f64 {
        self.commission_percentage / 100.0
    }

    pub fn slippage_rate(&self) -> f64 {
        self.slippage_percentage / 100.0
    }

    /// Rejects malformed parameters before any data is fetched.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.symbol.trim().is_empty() {
            return Err(EngineError::missing("backtest parameters", "symbol"));
        }
        if self.end_date <= self.start_date {
            return Err(EngineError::invalid(
                "endDate",
                format!(
                    "must be after startDate ({} <= {})",
                    self.end_date, self.start_date
                ),
            ));
        }
        if !self.initial_capital.is_finite() || self.initial_capital <= 0.0 {
            return Err(EngineError::invalid(
                "initialCapital",
                format!("must be positive (value: {})", self.initial_capital),
            ));
        }
        self.trade_sizing()?;
        for (key, value) in [
            ("commissionPercentage", self.commission_percentage),
            ("slippagePercentage", self.slippage_percentage),
        ] {
            if !value.is_finite() || !(0.0..100.0).contains(&value) {
                return Err(EngineError::invalid(
                    key,
                    format!("must be within [0, 100) (value: {})", value),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ExchangeSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub cache_dir: Option<PathBuf>,
    pub paper_trading: bool,
    pub paper_quote_asset: String,
    pub paper_quote_balance: f64,
}

impl ExchangeSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let base_url = optional_setting(settings, "BINANCE_BASE_URL")
            .unwrap_or(DEFAULT_BINANCE_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        let cache_dir = match optional_setting(settings, "CANDLE_CACHE_DIR") {
            Some(value) if value.eq_ignore_ascii_case("off") => None,
            Some(value) => Some(PathBuf::from(value)),
            None => Some(PathBuf::from(DEFAULT_CACHE_DIR)),
        };
        let paper_trading = match optional_setting(settings, "PAPER_TRADING") {
            Some(raw) => parse_bool_setting("PAPER_TRADING", raw)?,
            None => true,
        };
        let paper_quote_balance = match optional_setting(settings, "PAPER_QUOTE_BALANCE") {
            Some(_) => require_setting_f64(settings, "PAPER_QUOTE_BALANCE", Some(0.0), None)?,
            None => DEFAULT_PAPER_QUOTE_BALANCE,
        };

        Ok(Self {
            base_url,
            api_key: optional_setting(settings, "BINANCE_API_KEY").map(str::to_string),
            api_secret: optional_setting(settings, "BINANCE_API_SECRET").map(str::to_string),
            cache_dir,
            paper_trading,
            paper_quote_asset: optional_setting(settings, "QUOTE_ASSET")
                .unwrap_or(DEFAULT_QUOTE_ASSET)
                .to_uppercase(),
            paper_quote_balance,
        })
    }
}

#[derive(Debug, Clone)]
pub struct TradingSettings {
    pub symbols: Vec<String>,
    pub timeframe: Timeframe,
    pub poll_interval: Duration,
    pub trade_sizing: TradeSizing,
    pub quote_asset: String,
    pub history_lookback_days: i64,
}

impl TradingSettings {
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let symbols: Vec<String> = require_setting(settings, "TRADING_SYMBOLS")?
            .split(|c: char| c == ',' || c.is_whitespace())
            .map(|value| value.trim().to_uppercase())
            .filter(|value| !value.is_empty())
            .collect();
        if symbols.is_empty() {
            return Err(anyhow!("Setting TRADING_SYMBOLS must list at least one symbol"));
        }

        let timeframe: Timeframe = require_setting(settings, "TRADING_TIMEFRAME")?.parse()?;
        let poll_interval_secs = match optional_setting(settings, "TRADING_POLL_INTERVAL_SECS") {
            Some(_) => require_setting_u64(settings, "TRADING_POLL_INTERVAL_SECS", 1)?,
            None => DEFAULT_POLL_INTERVAL_SECS,
        };
        let mode: TradeSizeMode = require_setting(settings, "TRADE_SIZE_MODE")?.parse()?;
        let value = require_setting_f64(settings, "TRADE_SIZE_VALUE", Some(0.0), None)?;
        let trade_sizing = TradeSizing::new(mode, value)?;
        let history_lookback_days = match optional_setting(settings, "HISTORY_LOOKBACK_DAYS") {
            Some(_) => require_setting_u64(settings, "HISTORY_LOOKBACK_DAYS", 1)? as i64,
            None => DEFAULT_HISTORY_LOOKBACK_DAYS,
        };

        Ok(Self {
            symbols,
            timeframe,
            poll_interval: Duration::from_secs(poll_interval_secs),
            trade_sizing,
            quote_asset: optional_setting(settings, "QUOTE_ASSET")
                .unwrap_or(DEFAULT_QUOTE_ASSET)
                .to_uppercase(),
            history_lookback_days,
        })
    }
}

/// Collects the process environment entries this crate understands.
pub fn settings_from_env() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(key, _)| SETTING_PREFIXES.iter().any(|prefix| key.starts_with(prefix)))
        .collect()
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn require_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Result<&'a str> {
    optional_setting(settings, key).ok_or_else(|| anyhow!("Missing required setting {}", key))
}

fn parse_bool_setting(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(anyhow!("Setting {} must be a boolean (value: {})", key, raw)),
    }
}

fn require_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<f64> {
    let raw = require_setting(settings, key)?;
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(value)
}

fn require_setting_u64(settings: &HashMap<String, String>, key: &str, min: u64) -> Result<u64> {
    let raw = require_setting(settings, key)?;
    let value = raw
        .parse::<u64>()
        .map_err(|_| anyhow!("Setting {} must be a whole number (value: {})", key, raw))?;
    if value < min {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn settings(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sample_parameters() -> BacktestParameters {
        BacktestParameters {
            symbol: "BTCUSDT".to_string(),
            timeframe: Timeframe::OneDay,
            start_date: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            end_date: Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
            initial_capital: 10_000.0,
            trade_size_mode: Some(TradeSizeMode::PercentageOfCapital),
            trade_size_value: 10.0,
            commission_percentage: 0.1,
            slippage_percentage: 0.05,
            allow_short_selling: false,
        }
    }

    #[test]
    fn timeframe_parses_known_values_and_rejects_garbage() {
        assert_eq!("1h".parse::<Timeframe>().unwrap(), Timeframe::OneHour);
        assert_eq!(" Daily ".parse::<Timeframe>().unwrap(), Timeframe::OneDay);
        assert!(matches!(
            "7x".parse::<Timeframe>(),
            Err(EngineError::InvalidTimeframe(value)) if value == "7x"
        ));
    }

    #[test]
    fn backtest_parameters_reject_missing_trade_size_mode() {
        let mut params = sample_parameters();
        params.trade_size_mode = None;
        assert!(matches!(
            params.validate(),
            Err(EngineError::MissingParameter { key, .. }) if key == "tradeSizeMode"
        ));
    }

    #[test]
    fn backtest_parameters_reject_inverted_range_and_oversized_percentage() {
        let mut params = sample_parameters();
        params.end_date = params.start_date;
        assert!(params.validate().is_err());

        let mut params = sample_parameters();
        params.trade_size_value = 150.0;
        assert!(params.validate().is_err());

        assert!(sample_parameters().validate().is_ok());
    }

    #[test]
    fn backtest_parameters_deserialize_from_camel_case_json() {
        let json = r#"{
            "symbol": "ETHUSDT",
            "timeframe": "4h",
            "startDate": "2024-01-01T00:00:00Z",
            "endDate": "2024-02-01T00:00:00Z",
            "initialCapital": 5000,
            "tradeSizeMode": "FixedAmount",
            "tradeSizeValue": 250
        }"#;
        let params: BacktestParameters = serde_json::from_str(json).unwrap();
        assert_eq!(params.timeframe, Timeframe::FourHours);
        assert_eq!(params.commission_percentage, 0.0);
        assert!(!params.allow_short_selling);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn trading_settings_require_symbols_and_sizing() {
        let parsed = TradingSettings::from_settings_map(&settings(&[
            ("TRADING_SYMBOLS", "btcusdt, ethusdt"),
            ("TRADING_TIMEFRAME", "15m"),
            ("TRADE_SIZE_MODE", "percentage"),
            ("TRADE_SIZE_VALUE", "5"),
        ]))
        .unwrap();
        assert_eq!(parsed.symbols, vec!["BTCUSDT", "ETHUSDT"]);
        assert_eq!(parsed.poll_interval, Duration::from_secs(60));
        assert_eq!(parsed.history_lookback_days, 100);
        assert_eq!(parsed.quote_asset, "USDT");

        let missing = TradingSettings::from_settings_map(&settings(&[
            ("TRADING_SYMBOLS", "BTCUSDT"),
            ("TRADING_TIMEFRAME", "15m"),
        ]));
        assert!(missing.is_err());
    }

    #[test]
    fn exchange_settings_default_to_paper_with_cache() {
        let parsed = ExchangeSettings::from_settings_map(&HashMap::new()).unwrap();
        assert!(parsed.paper_trading);
        assert_eq!(parsed.base_url, DEFAULT_BINANCE_BASE_URL);
        assert_eq!(parsed.cache_dir, Some(PathBuf::from(DEFAULT_CACHE_DIR)));

        let disabled =
            ExchangeSettings::from_settings_map(&settings(&[("CANDLE_CACHE_DIR", "off")]))
                .unwrap();
        assert!(disabled.cache_dir.is_none());
    }
}
