use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;
use tradeloop::{
    candle_utils::normalize_symbol,
    commands::{analyze, backtest, filters, trade},
    config::{settings_from_env, ExchangeSettings, Timeframe, TradingSettings},
    context::AppContext,
};

#[derive(Parser)]
#[command(name = "tradeloop")]
#[command(about = "Rule-based strategy backtesting and live trading on Binance candles")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backtest a strategy config over a historical window
    Backtest {
        /// JSON file with backtest parameters (symbol, timeframe, dates, sizing, costs)
        #[arg(long, value_name = "PATH")]
        parameters: PathBuf,
        /// JSON file with the strategy name, parameters and filters
        #[arg(long, value_name = "PATH")]
        strategy: PathBuf,
        /// Write the full result as JSON
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Probability of the next bar's movement after a pattern of movements
    Markov {
        symbol: String,
        #[arg(long, default_value = "1d")]
        timeframe: String,
        #[arg(long, value_parser = parse_cli_date)]
        from: DateTime<Utc>,
        #[arg(long, value_parser = parse_cli_date)]
        to: DateTime<Utc>,
        /// Movements such as "UUD" or "up,up,down"
        #[arg(long)]
        pattern: String,
        #[arg(long, default_value = "up")]
        target: String,
    },
    /// How often runs of exactly N same-direction bars reverse on the next bar
    Reversal {
        symbol: String,
        #[arg(long, default_value = "1d")]
        timeframe: String,
        #[arg(long, value_parser = parse_cli_date)]
        from: DateTime<Utc>,
        #[arg(long, value_parser = parse_cli_date)]
        to: DateTime<Utc>,
        #[arg(long, default_value_t = 3)]
        run_length: usize,
    },
    /// Trade a strategy config live (paper trading unless PAPER_TRADING=false)
    Trade {
        /// JSON file with the strategy name, parameters and filters
        #[arg(long, value_name = "PATH")]
        strategy: PathBuf,
    },
    /// List available strategies and filters with their parameters
    Filters,
}

#[tokio::main]
async fn main() -> Result<()> {
    let Cli { command } = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Commands::Filters = command {
        filters::run();
        return Ok(());
    }

    let settings = settings_from_env();
    let app = AppContext::initialize(&ExchangeSettings::from_settings_map(&settings)?)?;
    info!("Starting tradeloop. Not financial advice. Use at your own risk.");

    match command {
        Commands::Backtest {
            parameters,
            strategy,
            output,
        } => {
            backtest::run(&app, &parameters, &strategy, output.as_deref()).await?;
        }
        Commands::Markov {
            symbol,
            timeframe,
            from,
            to,
            pattern,
            target,
        } => {
            let window = analysis_window(symbol, &timeframe, from, to)?;
            analyze::run_markov(&app, &window, &pattern, &target).await?;
        }
        Commands::Reversal {
            symbol,
            timeframe,
            from,
            to,
            run_length,
        } => {
            let window = analysis_window(symbol, &timeframe, from, to)?;
            analyze::run_reversal(&app, &window, run_length).await?;
        }
        Commands::Trade { strategy } => {
            let trading = TradingSettings::from_settings_map(&settings)?;
            trade::run(&app, &strategy, trading).await?;
        }
        Commands::Filters => {}
    }

    Ok(())
}

fn analysis_window(
    symbol: String,
    timeframe: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<analyze::AnalysisWindow> {
    if to <= from {
        return Err(anyhow!("--to must be after --from"));
    }
    Ok(analyze::AnalysisWindow {
        symbol: normalize_symbol(&symbol).ok_or_else(|| anyhow!("symbol must not be blank"))?,
        timeframe: timeframe.parse::<Timeframe>()?,
        from,
        to,
    })
}

fn parse_cli_date(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
        .ok_or_else(|| format!("expected YYYY-MM-DD or RFC 3339, got '{}'", raw))
}
