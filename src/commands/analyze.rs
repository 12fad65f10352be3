use crate::analytics::{analyze_markov, analyze_reversals, parse_movement, parse_pattern};
use crate::candle_utils::movements;
use crate::config::Timeframe;
use crate::context::AppContext;
use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{info, warn};

pub struct AnalysisWindow {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

pub async fn run_markov(
    app: &AppContext,
    window: &AnalysisWindow,
    pattern: &str,
    target: &str,
) -> Result<()> {
    let pattern = parse_pattern(pattern)?;
    let target = parse_movement(target)?;
    let candles = app
        .load_candles(&window.symbol, window.timeframe, window.from, window.to)
        .await?;
    if candles.is_empty() {
        warn!("No candles for {} {}", window.symbol, window.timeframe);
    }

    let analysis = analyze_markov(&movements(&candles), &pattern, target);
    let pattern_label: Vec<&str> = pattern.iter().map(|m| m.as_str()).collect();
    info!(
        "{} {}: after [{}] the next bar was {} in {}/{} cases (p = {:.4})",
        window.symbol,
        window.timeframe,
        pattern_label.join(", "),
        target.as_str(),
        analysis.hits,
        analysis.occurrences,
        analysis.probability
    );
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}

pub async fn run_reversal(app: &AppContext, window: &AnalysisWindow, run_length: usize) -> Result<()> {
    let candles = app
        .load_candles(&window.symbol, window.timeframe, window.from, window.to)
        .await?;
    let analysis = analyze_reversals(&candles, run_length);
    info!(
        "{} {}: {} up runs of {} reversed {} times ({:.1}%), {} down runs reversed {} times ({:.1}%)",
        window.symbol,
        window.timeframe,
        analysis.up_runs,
        run_length,
        analysis.up_reversals,
        analysis.up_reversal_probability * 100.0,
        analysis.down_runs,
        analysis.down_reversals,
        analysis.down_reversal_probability * 100.0
    );
    println!("{}", serde_json::to_string_pretty(&analysis)?);
    Ok(())
}
