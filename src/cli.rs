//! CLI definition and dispatch.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use crate::adapters::csv_market_adapter::CsvMarketAdapter;
use crate::adapters::file_config_adapter::FileConfigAdapter;
use crate::adapters::json_state_store::JsonStateStore;
use crate::domain::config_validation::load_engine_config;
use crate::domain::error::LivebookError;
use crate::domain::metrics::Metrics;
use crate::domain::run::{self, EngineConfig, RunResult, RunStatus, StateSummary};
use crate::ports::config_port::ConfigPort;
use crate::ports::market_port::MarketDataPort;
use crate::ports::state_port::StateStore;

#[derive(Parser, Debug)]
#[command(name = "livebook", about = "Daily portfolio state-transition engine")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Process one trading day
    Run {
        #[arg(short, long)]
        config: PathBuf,
        /// Day to process; defaults to the latest day in the market file
        #[arg(long)]
        date: Option<NaiveDate>,
        /// Process every unprocessed day in order, up to --date if given
        #[arg(long)]
        catch_up: bool,
    },
    /// Show the committed portfolio state
    Status {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Performance summary from the ledgers
    Report {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Validate a configuration file
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Paths and engine settings resolved from one INI file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub engine: EngineConfig,
    pub state_dir: PathBuf,
    pub market_csv: Option<PathBuf>,
}

pub fn run(cli: Cli) -> ExitCode {
    let result = match cli.command {
        Command::Run {
            config,
            date,
            catch_up,
        } => run_engine(&config, date, catch_up),
        Command::Status { config } => run_status(&config),
        Command::Report { config, json } => run_report(&config, json),
        Command::Validate { config } => run_validate(&config),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            (&e).into()
        }
    }
}

/// Relative paths in the config are taken relative to the config file.
fn resolve(base: &Path, value: &str) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

pub fn build_settings(adapter: &dyn ConfigPort, base: &Path) -> Result<Settings, LivebookError> {
    let engine = load_engine_config(adapter)?;
    let state_dir = adapter
        .get_string("portfolio", "state_dir")
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| LivebookError::ConfigMissing {
            section: "portfolio".into(),
            key: "state_dir".into(),
        })?;
    let market_csv = adapter
        .get_string("data", "market_csv")
        .filter(|s| !s.trim().is_empty())
        .map(|s| resolve(base, s.trim()));

    Ok(Settings {
        engine,
        state_dir: resolve(base, state_dir.trim()),
        market_csv,
    })
}

pub fn load_settings(path: &Path) -> Result<Settings, LivebookError> {
    let adapter = FileConfigAdapter::from_file(path)?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));
    build_settings(&adapter, base)
}

/// Run the engine for one date, or every pending date with `catch_up`.
pub fn execute_run(
    settings: &Settings,
    date: Option<NaiveDate>,
    catch_up: bool,
) -> Result<Vec<RunResult>, LivebookError> {
    let csv = settings
        .market_csv
        .as_ref()
        .ok_or_else(|| LivebookError::ConfigMissing {
            section: "data".into(),
            key: "market_csv".into(),
        })?;
    let market = CsvMarketAdapter::open(csv)?;
    let store = JsonStateStore::new(&settings.state_dir);

    if catch_up {
        return run::catch_up(&store, &market, &settings.engine, date);
    }

    let date = match date {
        Some(d) => d,
        None => market
            .available_dates()?
            .last()
            .copied()
            .ok_or_else(|| LivebookError::MarketData {
                reason: format!("{} has no rows", csv.display()),
            })?,
    };
    let view = market.load_day(date)?;
    Ok(vec![run::run(&store, &view, &settings.engine)?])
}

fn run_engine(config_path: &Path, date: Option<NaiveDate>, catch_up: bool) -> Result<(), LivebookError> {
    eprintln!("Loading config from {}", config_path.display());
    let settings = load_settings(config_path)?;
    let results = execute_run(&settings, date, catch_up)?;

    if results.is_empty() {
        eprintln!("Nothing to process");
    }
    for result in &results {
        print_run(result);
    }
    if let Some(last) = results.last() {
        print_summary(&last.summary);
    }
    Ok(())
}

fn print_run(result: &RunResult) {
    match result.status {
        RunStatus::AlreadyProcessed => {
            eprintln!("{}: already processed, nothing done", result.date);
        }
        RunStatus::Committed => {
            eprintln!("{}: committed, {} trades", result.date, result.trades.len());
            for t in &result.trades {
                let reason = t.reason.map(|r| format!(" ({r})")).unwrap_or_default();
                eprintln!(
                    "  {:?} {} x{} @ {:.4}{}",
                    t.side, t.symbol, t.shares, t.price, reason
                );
            }
            for event in &result.events {
                eprintln!("  {event}");
            }
        }
    }
}

fn print_summary(summary: &StateSummary) {
    let date = summary
        .last_processed_date
        .map(|d| d.to_string())
        .unwrap_or_else(|| "never".into());
    eprintln!("\n=== Portfolio ===");
    eprintln!("Last processed:   {}", date);
    eprintln!("Equity:           {:.2}", summary.equity);
    eprintln!("Cash:             {:.2}", summary.cash);
    eprintln!("Reserved:         {:.2}", summary.reserved);
    eprintln!("Positions value:  {:.2}", summary.positions_value);
    eprintln!("Positions:        {}", summary.positions.join(", "));
    eprintln!("Pending buys:     {}", summary.pending_buys.join(", "));
    for exit in &summary.pending_exits {
        eprintln!("Pending exit:     {} ({})", exit.symbol, exit.reason);
    }
}

fn run_status(config_path: &Path) -> Result<(), LivebookError> {
    let settings = load_settings(config_path)?;
    let store = JsonStateStore::new(&settings.state_dir);
    match store.load()? {
        Some(state) => print_summary(&StateSummary::from(&state)),
        None => eprintln!("No committed state in {}", settings.state_dir.display()),
    }
    Ok(())
}

/// Metrics over the committed ledgers of the configured store.
pub fn build_report(settings: &Settings) -> Result<Metrics, LivebookError> {
    let store = JsonStateStore::new(&settings.state_dir);
    let initial_capital = store
        .load()?
        .map(|s| s.initial_capital)
        .unwrap_or(settings.engine.initial_capital);
    Ok(Metrics::compute(
        &store.read_equity()?,
        &store.read_trades()?,
        initial_capital,
    ))
}

fn run_report(config_path: &Path, json: bool) -> Result<(), LivebookError> {
    let settings = load_settings(config_path)?;
    let metrics = build_report(&settings)?;

    if json {
        let out = serde_json::to_string_pretty(&metrics).map_err(|e| LivebookError::Ledger {
            path: settings.state_dir.display().to_string(),
            reason: e.to_string(),
        })?;
        println!("{out}");
        return Ok(());
    }

    println!("=== Performance ===");
    println!("Final Equity:     {:.2}", metrics.final_equity);
    println!("Total Return:     {:.2}%", metrics.total_return * 100.0);
    println!("Annualized:       {:.2}%", metrics.annualized_return * 100.0);
    println!("Sharpe Ratio:     {:.2}", metrics.sharpe_ratio);
    println!("Sortino Ratio:    {:.2}", metrics.sortino_ratio);
    println!(
        "Max Drawdown:     -{:.1}% ({} sessions)",
        metrics.max_drawdown * 100.0,
        metrics.max_drawdown_duration
    );
    println!(
        "Closed Trades:    {}",
        metrics.trades_won + metrics.trades_lost + metrics.trades_breakeven
    );
    println!("Win Rate:         {:.1}%", metrics.win_rate * 100.0);
    println!("Profit Factor:    {:.2}", metrics.profit_factor);
    println!("Avg Holding Days: {:.1}", metrics.avg_holding_days);
    if !metrics.exits_by_reason.is_empty() {
        println!("\n=== Exits ===");
        for (reason, count) in &metrics.exits_by_reason {
            println!("  {:<20} {}", reason, count);
        }
    }
    Ok(())
}

fn run_validate(config_path: &Path) -> Result<(), LivebookError> {
    eprintln!("Validating {}", config_path.display());
    let settings = load_settings(config_path)?;
    eprintln!("Config validated successfully");
    eprintln!("  state_dir:     {}", settings.state_dir.display());
    eprintln!("  max_positions: {}", settings.engine.selector.max_positions);
    Ok(())
}
