#![allow(dead_code)]

use chrono::NaiveDate;
use livebook::domain::error::LivebookError;
use livebook::domain::execution::ExecutionConfig;
use livebook::domain::exit_rules::ExitRules;
pub use livebook::domain::market::{MarketBar, MarketView};
use livebook::domain::portfolio::{EquityPoint, PortfolioState};
use livebook::domain::position::Trade;
use livebook::domain::run::EngineConfig;
use livebook::domain::signal::SelectorConfig;
use livebook::ports::market_port::MarketDataPort;
use livebook::ports::state_port::{RunGuard, StateStore};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;

/// In-memory store that records what was committed and whether the lock is held.
#[derive(Default)]
pub struct MockStateStore {
    pub state: RefCell<Option<PortfolioState>>,
    pub trades: RefCell<Vec<Trade>>,
    pub equity: RefCell<Vec<EquityPoint>>,
    pub locked: Cell<bool>,
    pub lock_count: Cell<usize>,
    pub commits: Cell<usize>,
    pub fail_commit: bool,
}

pub struct MockGuard<'a> {
    locked: &'a Cell<bool>,
}

impl RunGuard for MockGuard<'_> {}

impl Drop for MockGuard<'_> {
    fn drop(&mut self) {
        self.locked.set(false);
    }
}

impl MockStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(self, state: PortfolioState) -> Self {
        *self.state.borrow_mut() = Some(state);
        self
    }

    pub fn failing_commit(mut self) -> Self {
        self.fail_commit = true;
        self
    }

    pub fn committed(&self) -> Option<PortfolioState> {
        self.state.borrow().clone()
    }
}

impl StateStore for MockStateStore {
    fn lock(&self) -> Result<Box<dyn RunGuard + '_>, LivebookError> {
        if self.locked.get() {
            return Err(LivebookError::LockHeld {
                path: "memory".into(),
                owner: "test".into(),
            });
        }
        self.locked.set(true);
        self.lock_count.set(self.lock_count.get() + 1);
        Ok(Box::new(MockGuard {
            locked: &self.locked,
        }))
    }

    fn load(&self) -> Result<Option<PortfolioState>, LivebookError> {
        Ok(self.state.borrow().clone())
    }

    fn commit(
        &self,
        state: &PortfolioState,
        trades: &[Trade],
        equity: &EquityPoint,
    ) -> Result<(), LivebookError> {
        assert!(self.locked.get(), "commit without holding the run lock");
        if self.fail_commit {
            return Err(LivebookError::Io(std::io::Error::other("disk full")));
        }
        *self.state.borrow_mut() = Some(state.clone());
        self.trades.borrow_mut().extend_from_slice(trades);
        self.equity.borrow_mut().push(equity.clone());
        self.commits.set(self.commits.get() + 1);
        Ok(())
    }

    fn read_trades(&self) -> Result<Vec<Trade>, LivebookError> {
        Ok(self.trades.borrow().clone())
    }

    fn read_equity(&self) -> Result<Vec<EquityPoint>, LivebookError> {
        Ok(self.equity.borrow().clone())
    }
}

pub struct MockMarket {
    pub days: BTreeMap<NaiveDate, Vec<MarketBar>>,
}

impl MockMarket {
    pub fn new() -> Self {
        Self {
            days: BTreeMap::new(),
        }
    }

    pub fn with_day(mut self, date: NaiveDate, bars: Vec<MarketBar>) -> Self {
        self.days.insert(date, bars);
        self
    }
}

impl MarketDataPort for MockMarket {
    fn available_dates(&self) -> Result<Vec<NaiveDate>, LivebookError> {
        Ok(self.days.keys().copied().collect())
    }

    fn load_day(&self, date: NaiveDate) -> Result<MarketView, LivebookError> {
        let bars = self
            .days
            .get(&date)
            .ok_or(LivebookError::NoMarketData { date })?;
        MarketView::new(date, bars.clone())
    }
}

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// Flat bar: open, high, low and close all at `price`.
pub fn make_bar(symbol: &str, date: NaiveDate, price: f64, score: f64) -> MarketBar {
    MarketBar {
        symbol: symbol.to_string(),
        date,
        open: price,
        high: price,
        low: price,
        close: price,
        volume: 10_000,
        model_score: score,
        rs_rank: None,
    }
}

pub fn make_ohlc_bar(
    symbol: &str,
    date: NaiveDate,
    (open, high, low, close): (f64, f64, f64, f64),
    score: f64,
) -> MarketBar {
    MarketBar {
        open,
        high,
        low,
        close,
        ..make_bar(symbol, date, close, score)
    }
}

pub fn view(date: NaiveDate, bars: Vec<MarketBar>) -> MarketView {
    MarketView::new(date, bars).unwrap()
}

/// Five-slot engine with a 5% stop and no stagnation exit, so flat test
/// prices only trigger what a test sets up.
pub fn sample_config() -> EngineConfig {
    EngineConfig {
        initial_capital: 100_000.0,
        selector: SelectorConfig {
            max_positions: 5,
            min_ticket_size: 1_000.0,
        },
        exit_rules: ExitRules {
            stop_loss_pct: 0.05,
            stagnation_days: 0,
            top_k: 5,
            ..ExitRules::default()
        },
        execution: ExecutionConfig::default(),
    }
}
