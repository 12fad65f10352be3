use crate::config::BacktestParameters;
use crate::context::AppContext;
use crate::models::BacktestResult;
use crate::strategy::StrategyConfig;
use anyhow::{Context, Result};
use log::info;
use serde::de::DeserializeOwned;
use std::path::Path;

pub async fn run(
    app: &AppContext,
    parameters_file: &Path,
    strategy_file: &Path,
    output: Option<&Path>,
) -> Result<()> {
    let parameters: BacktestParameters = read_json(parameters_file).await?;
    let strategy: StrategyConfig = read_json(strategy_file).await?;
    info!(
        "Backtesting {} with {} filter(s) on {} {} from {} to {}",
        strategy.strategy,
        strategy.filters.len(),
        parameters.symbol,
        parameters.timeframe,
        parameters.start_date.format("%Y-%m-%d"),
        parameters.end_date.format("%Y-%m-%d")
    );

    let result = app.run_backtest(&parameters, &strategy).await?;
    log_summary(&result);

    if let Some(path) = output {
        let payload = serde_json::to_vec_pretty(&result).context("Failed to encode backtest result")?;
        tokio::fs::write(path, payload)
            .await
            .with_context(|| format!("Failed to write backtest result to {}", path.display()))?;
        info!("Backtest result written to {}", path.display());
    }
    Ok(())
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

fn log_summary(result: &BacktestResult) {
    let perf = &result.performance;
    info!(
        "Capital {:.2} -> {:.2} ({:+.2}%), realized PnL {:.2}",
        result.starting_capital, result.final_capital, perf.total_return_percent, result.realized_pnl
    );
    info!(
        "Trades: {} wins, {} losses, {} held; win rate {:.1}%",
        result.win_count,
        result.loss_count,
        result.hold_count,
        perf.win_rate * 100.0
    );
    info!(
        "Avg trade {:.2}, best {:.2}, worst {:.2}, std dev {:.2}, max drawdown {:.2} ({:.2}%)",
        perf.avg_trade_pnl,
        perf.best_trade,
        perf.worst_trade,
        perf.trade_pnl_std_dev,
        perf.max_drawdown,
        perf.max_drawdown_percent
    );
    for held in &result.held_assets {
        info!(
            "Holding {:.8} {} bought at {:.4}, worth {:.2}",
            held.quantity, held.symbol, held.entry_price, held.market_value
        );
    }
}
