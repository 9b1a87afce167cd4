//! Run coordination: one locked, all-or-nothing state transition per day.
//!
//! [`process_day`] is the pure transition from yesterday's committed state and
//! today's view to today's state. [`run`] wraps it with the store lock, the
//! already-processed check and the commit. Nothing is written unless every
//! step and every invariant check succeeds.

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use super::error::LivebookError;
use super::events::RunEvent;
use super::execution::{self, ExecutionConfig};
use super::exit_rules::{self, ExitReason, ExitRules};
use super::market::MarketView;
use super::portfolio::{verify_cash_flow, EquityPoint, PortfolioState};
use super::position::Trade;
use super::signal::{self, SelectorConfig};
use crate::ports::market_port::MarketDataPort;
use crate::ports::state_port::StateStore;

/// Everything the engine needs to know besides state and market data.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub initial_capital: f64,
    pub selector: SelectorConfig,
    pub exit_rules: ExitRules,
    pub execution: ExecutionConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            initial_capital: 100_000.0,
            selector: SelectorConfig::default(),
            exit_rules: ExitRules::default(),
            execution: ExecutionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Committed,
    AlreadyProcessed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingExitSummary {
    pub symbol: String,
    pub reason: ExitReason,
}

/// Read-only digest of a committed state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSummary {
    pub last_processed_date: Option<NaiveDate>,
    pub cash: f64,
    pub reserved: f64,
    pub positions_value: f64,
    pub equity: f64,
    pub positions: Vec<String>,
    pub pending_buys: Vec<String>,
    pub pending_exits: Vec<PendingExitSummary>,
}

impl From<&PortfolioState> for StateSummary {
    fn from(state: &PortfolioState) -> Self {
        StateSummary {
            last_processed_date: state.last_processed_date,
            cash: state.cash,
            reserved: state.reserved_capital(),
            positions_value: state.positions_value(),
            equity: state.total_equity(),
            positions: state.positions.keys().cloned().collect(),
            pending_buys: state.pending_buys.iter().map(|o| o.symbol.clone()).collect(),
            pending_exits: state
                .positions
                .values()
                .filter_map(|p| {
                    p.pending_exit.as_ref().map(|d| PendingExitSummary {
                        symbol: p.symbol.clone(),
                        reason: d.reason,
                    })
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub status: RunStatus,
    pub date: NaiveDate,
    pub trades: Vec<Trade>,
    pub events: Vec<RunEvent>,
    pub equity: Option<EquityPoint>,
    pub summary: StateSummary,
}

/// Output of a successful [`process_day`], ready to commit.
#[derive(Debug, Clone, PartialEq)]
pub struct DayOutcome {
    pub state: PortfolioState,
    pub trades: Vec<Trade>,
    pub events: Vec<RunEvent>,
    pub equity: EquityPoint,
}

/// Compute today's state from `state` without touching storage.
///
/// Settles yesterday's decisions, evaluates exits on the surviving
/// positions, queues tomorrow's buys and checks every invariant on the result.
pub fn process_day(
    state: &PortfolioState,
    view: &MarketView,
    config: &EngineConfig,
) -> Result<DayOutcome, LivebookError> {
    let today = view.date();
    if let Some(last) = state.last_processed_date
        && today <= last
    {
        return Err(LivebookError::invariant(
            "run",
            "date_strictly_increasing",
            format!("{} is not after {}", today, last),
        ));
    }

    let mut next = state.clone();
    let settlement = execution::settle_day(
        &mut next,
        view,
        &config.execution,
        config.exit_rules.stagnation_band,
    )?;
    let mut events = settlement.events;

    for decision in exit_rules::scan(next.positions.values(), view, &config.exit_rules) {
        info!(symbol = %decision.symbol, reason = %decision.reason, "exit decided");
        events.push(RunEvent::ExitDecided {
            symbol: decision.symbol.clone(),
            reason: decision.reason,
        });
        if let Some(position) = next.positions.get_mut(&decision.symbol) {
            position.pending_exit = Some(decision);
        }
    }

    let plan = signal::plan_buys(&next, view, &config.selector);
    events.extend(plan.apply(&mut next));

    let equity = next.equity_point(today);
    next.last_processed_date = Some(today);
    next.last_equity = Some(equity.equity);

    next.check_invariants(config.selector.max_positions)?;
    verify_cash_flow(state, &next, &settlement.trades)?;

    Ok(DayOutcome {
        state: next,
        trades: settlement.trades,
        events,
        equity,
    })
}

/// Run the engine for `view.date()` against `store`.
///
/// Returns `AlreadyProcessed` without touching the store when the date is not
/// newer than the committed state. The lock is released on every path.
pub fn run(
    store: &dyn StateStore,
    view: &MarketView,
    config: &EngineConfig,
) -> Result<RunResult, LivebookError> {
    let today = view.date();
    if view.is_empty() {
        return Err(LivebookError::NoMarketData { date: today });
    }

    let _guard = store.lock()?;
    let state = match store.load()? {
        Some(state) => state,
        None => {
            info!(initial_capital = config.initial_capital, "no committed state, starting fresh");
            PortfolioState::new(config.initial_capital)
        }
    };

    if let Some(last) = state.last_processed_date
        && today <= last
    {
        info!(%today, %last, "date already processed, nothing to do");
        return Ok(RunResult {
            status: RunStatus::AlreadyProcessed,
            date: today,
            trades: Vec::new(),
            events: Vec::new(),
            equity: None,
            summary: StateSummary::from(&state),
        });
    }

    let outcome = process_day(&state, view, config).inspect_err(|e| {
        warn!(%today, error = %e, "run aborted, nothing committed");
    })?;
    store.commit(&outcome.state, &outcome.trades, &outcome.equity)?;

    info!(
        %today,
        trades = outcome.trades.len(),
        equity = outcome.equity.equity,
        positions = outcome.state.position_count(),
        pending_buys = outcome.state.pending_buys.len(),
        "run committed"
    );
    Ok(RunResult {
        status: RunStatus::Committed,
        date: today,
        summary: StateSummary::from(&outcome.state),
        trades: outcome.trades,
        events: outcome.events,
        equity: Some(outcome.equity),
    })
}

/// Run every date the market source has after the committed state, in order,
/// up to and including `until` when given. Each date is its own locked run.
pub fn catch_up(
    store: &dyn StateStore,
    market: &dyn MarketDataPort,
    config: &EngineConfig,
    until: Option<NaiveDate>,
) -> Result<Vec<RunResult>, LivebookError> {
    let last = store.load()?.and_then(|s| s.last_processed_date);
    let dates: Vec<NaiveDate> = market
        .available_dates()?
        .into_iter()
        .filter(|d| last.is_none_or(|l| *d > l))
        .filter(|d| until.is_none_or(|u| *d <= u))
        .collect();

    if dates.is_empty() {
        info!("no unprocessed dates");
    }

    let mut results = Vec::with_capacity(dates.len());
    for date in dates {
        let view = market.load_day(date)?;
        results.push(run(store, &view, config)?);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::MarketBar;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 7, day).unwrap()
    }

    fn bar(date: NaiveDate, symbol: &str, price: f64, score: f64) -> MarketBar {
        MarketBar {
            symbol: symbol.into(),
            date,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: 1_000,
            model_score: score,
            rs_rank: None,
        }
    }

    fn flat_view(date: NaiveDate) -> MarketView {
        MarketView::new(
            date,
            vec![
                bar(date, "AKBNK", 10.0, 0.9),
                bar(date, "BIMAS", 20.0, 0.8),
                bar(date, "SISE", 40.0, 0.7),
            ],
        )
        .unwrap()
    }

    fn config() -> EngineConfig {
        EngineConfig {
            initial_capital: 30_000.0,
            selector: SelectorConfig {
                max_positions: 3,
                min_ticket_size: 1_000.0,
            },
            execution: ExecutionConfig {
                commission_pct: 0.0,
                ..ExecutionConfig::default()
            },
            exit_rules: ExitRules {
                stagnation_days: 0,
                top_k: 3,
                ..ExitRules::default()
            },
        }
    }

    #[test]
    fn first_day_only_queues_buys() {
        let state = PortfolioState::new(30_000.0);
        let out = process_day(&state, &flat_view(d(1)), &config()).unwrap();
        assert!(out.trades.is_empty());
        assert_eq!(out.state.pending_buys.len(), 3);
        assert!(out.state.cash.abs() < 1e-6);
        assert!((out.equity.equity - 30_000.0).abs() < 1e-6);
        assert_eq!(out.state.last_processed_date, Some(d(1)));
    }

    #[test]
    fn second_day_settles_yesterdays_buys() {
        let state = PortfolioState::new(30_000.0);
        let day1 = process_day(&state, &flat_view(d(1)), &config()).unwrap();
        let day2 = process_day(&day1.state, &flat_view(d(2)), &config()).unwrap();
        assert_eq!(day2.trades.len(), 3);
        assert_eq!(day2.state.position_count(), 3);
        assert!(day2.state.pending_buys.is_empty());
        assert_eq!(day2.state.get_position("AKBNK").unwrap().shares, 1_000);
        assert!((day2.equity.equity - 30_000.0).abs() < 1e-6);
    }

    #[test]
    fn stale_date_is_rejected_by_the_pure_transition() {
        let state = PortfolioState::new(30_000.0);
        let day1 = process_day(&state, &flat_view(d(2)), &config()).unwrap();
        let err = process_day(&day1.state, &flat_view(d(2)), &config()).unwrap_err();
        assert!(err.to_string().contains("date_strictly_increasing"));
    }

    #[test]
    fn stop_decided_today_settles_tomorrow_at_stop() {
        let cfg = config();
        let state = PortfolioState::new(30_000.0);
        let day1 = process_day(&state, &flat_view(d(1)), &cfg).unwrap();
        let day2 = process_day(&day1.state, &flat_view(d(2)), &cfg).unwrap();

        let mut ak = bar(d(3), "AKBNK", 9.8, 0.9);
        ak.low = 9.0;
        ak.close = 9.2;
        let crash = MarketView::new(
            d(3),
            vec![ak, bar(d(3), "BIMAS", 20.0, 0.8), bar(d(3), "SISE", 40.0, 0.7)],
        )
        .unwrap();

        let day3 = process_day(&day2.state, &crash, &cfg).unwrap();
        assert!(day3.trades.is_empty());
        assert!(day3.events.contains(&RunEvent::ExitDecided {
            symbol: "AKBNK".into(),
            reason: ExitReason::StopLoss,
        }));

        let day4 = process_day(&day3.state, &flat_view(d(4)), &cfg).unwrap();
        let sell = &day4.trades[0];
        assert_eq!(sell.symbol, "AKBNK");
        assert_eq!(sell.reason, Some(ExitReason::StopLoss));
        assert!((sell.price - 9.5).abs() < 1e-9);
        // The freed slot is refilled with a pending buy for tomorrow.
        assert_eq!(day4.state.pending_buys.len(), 1);
        assert_eq!(day4.state.pending_buys[0].symbol, "AKBNK");
    }

    #[test]
    fn summary_lists_pending_exits() {
        let mut state = PortfolioState::new(1_000.0);
        state.add_position(crate::domain::position::Position {
            symbol: "SISE".into(),
            shares: 10,
            entry_price: 40.0,
            entry_date: d(1),
            entry_commission: 0.0,
            days_held: 2,
            last_known_price: 41.0,
            stagnant_sessions: 0,
            pending_exit: Some(crate::domain::exit_rules::ExitDecision {
                symbol: "SISE".into(),
                reason: ExitReason::TimeExit,
                target: crate::domain::exit_rules::ExitPrice::NextOpen,
                decided_on: d(2),
            }),
        });
        let summary = StateSummary::from(&state);
        assert_eq!(summary.positions, vec!["SISE".to_string()]);
        assert_eq!(summary.pending_exits[0].reason, ExitReason::TimeExit);
        assert!((summary.equity - 1_410.0).abs() < 1e-9);
    }
}
