pub mod analytics;
pub mod backtest;
pub mod binance;
pub mod cache;
pub mod candle_utils;
pub mod config;
pub mod context;
pub mod error;
pub mod exchange;
pub mod filters;
pub mod indicators;
pub mod models;
pub mod paper;
pub mod param_utils;
pub mod performance;
pub mod series;
pub mod sessions;
pub mod strategy;
pub mod trading;
pub mod trading_rules;

pub mod commands {
    pub mod analyze;
    pub mod backtest;
    pub mod filters;
    pub mod trade;
}
