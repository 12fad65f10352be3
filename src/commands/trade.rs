use crate::commands::backtest::read_json;
use crate::config::TradingSettings;
use crate::context::AppContext;
use crate::sessions::SessionConfig;
use crate::strategy::StrategyConfig;
use anyhow::{Context, Result};
use log::info;
use std::path::Path;

/// Runs one trading session until Ctrl-C.
pub async fn run(app: &AppContext, strategy_file: &Path, trading: TradingSettings) -> Result<()> {
    let strategy: StrategyConfig = read_json(strategy_file).await?;
    let manager = app.session_manager();
    let id = manager.start_session(SessionConfig { strategy, trading })?;
    info!("Session {} running; press Ctrl-C to stop", id);

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    let info = manager.stop_session(id).await?;
    info!(
        "Session {} stopped after placing {} order(s); {} position(s) still open",
        id,
        info.orders_placed,
        info.status.open_positions.len()
    );
    Ok(())
}
