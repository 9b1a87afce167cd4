//! Portfolio state, pending orders and equity tracking.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use super::error::LivebookError;
use super::position::{Position, Trade};

/// Tolerance for floating point cash comparisons.
pub const CASH_EPSILON: f64 = 1e-6;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingBuy {
    pub symbol: String,
    pub planned_capital: f64,
    pub decision_date: NaiveDate,
    /// Runs this order was carried over because its symbol had no bar.
    #[serde(default)]
    pub deferrals: u32,
}

/// Append-only equity ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub equity: f64,
    pub cash: f64,
    pub reserved: f64,
    pub positions_value: f64,
    pub daily_return: f64,
    pub n_positions: usize,
}

/// The committed portfolio of one strategy instance.
///
/// `cash` is free cash only; capital promised to pending buys sits in
/// [`PendingBuy::planned_capital`] until the order settles or is discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioState {
    pub initial_capital: f64,
    pub cash: f64,
    pub positions: BTreeMap<String, Position>,
    pub pending_buys: Vec<PendingBuy>,
    pub last_processed_date: Option<NaiveDate>,
    /// Equity at the last committed run, for daily returns.
    #[serde(default)]
    pub last_equity: Option<f64>,
}

impl PortfolioState {
    pub fn new(initial_capital: f64) -> Self {
        PortfolioState {
            initial_capital,
            cash: initial_capital,
            positions: BTreeMap::new(),
            pending_buys: Vec::new(),
            last_processed_date: None,
            last_equity: None,
        }
    }

    pub fn add_position(&mut self, position: Position) {
        self.positions.insert(position.symbol.clone(), position);
    }

    pub fn get_position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn remove_position(&mut self, symbol: &str) -> Option<Position> {
        self.positions.remove(symbol)
    }

    pub fn position_count(&self) -> usize {
        self.positions.len()
    }

    pub fn has_pending_buy(&self, symbol: &str) -> bool {
        self.pending_buys.iter().any(|o| o.symbol == symbol)
    }

    /// Open positions plus pending buys.
    pub fn used_slots(&self) -> usize {
        self.positions.len() + self.pending_buys.len()
    }

    pub fn reserved_capital(&self) -> f64 {
        self.pending_buys.iter().map(|o| o.planned_capital).sum()
    }

    pub fn positions_value(&self) -> f64 {
        self.positions.values().map(Position::market_value).sum()
    }

    /// Cash plus reservations plus positions marked at their last known price.
    pub fn total_equity(&self) -> f64 {
        self.cash + self.reserved_capital() + self.positions_value()
    }

    /// Cash that is not tied up in positions: free plus reserved.
    pub fn liquid_capital(&self) -> f64 {
        self.cash + self.reserved_capital()
    }

    /// Snapshot today's equity as a ledger row.
    pub fn equity_point(&self, date: NaiveDate) -> EquityPoint {
        let equity = self.total_equity();
        let daily_return = match self.last_equity {
            Some(prev) if prev > 0.0 => equity / prev - 1.0,
            _ => 0.0,
        };
        EquityPoint {
            date,
            equity,
            cash: self.cash,
            reserved: self.reserved_capital(),
            positions_value: self.positions_value(),
            daily_return,
            n_positions: self.positions.len(),
        }
    }

    /// Structural invariants that must hold for any committed state.
    pub fn check_invariants(&self, max_positions: usize) -> Result<(), LivebookError> {
        const COMPONENT: &str = "portfolio";

        if !self.cash.is_finite() || self.cash < -CASH_EPSILON {
            return Err(LivebookError::invariant(
                COMPONENT,
                "cash_non_negative",
                format!("cash={:.6}", self.cash),
            ));
        }

        for (key, pos) in &self.positions {
            if key != &pos.symbol {
                return Err(LivebookError::invariant(
                    COMPONENT,
                    "position_keyed_by_symbol",
                    format!("key {} holds {}", key, pos.symbol),
                ));
            }
            if pos.shares == 0 {
                return Err(LivebookError::invariant(
                    COMPONENT,
                    "position_shares_positive",
                    pos.symbol.clone(),
                ));
            }
        }

        let mut pending = HashSet::new();
        for order in &self.pending_buys {
            if !pending.insert(order.symbol.as_str()) {
                return Err(LivebookError::invariant(
                    COMPONENT,
                    "one_pending_buy_per_symbol",
                    order.symbol.clone(),
                ));
            }
            if self.positions.contains_key(&order.symbol) {
                return Err(LivebookError::invariant(
                    COMPONENT,
                    "no_pending_buy_for_open_position",
                    order.symbol.clone(),
                ));
            }
            if !(order.planned_capital.is_finite() && order.planned_capital > 0.0) {
                return Err(LivebookError::invariant(
                    COMPONENT,
                    "planned_capital_positive",
                    format!("{}={}", order.symbol, order.planned_capital),
                ));
            }
        }

        if self.used_slots() > max_positions {
            return Err(LivebookError::invariant(
                COMPONENT,
                "position_cap",
                format!(
                    "{} positions + {} pending > {}",
                    self.positions.len(),
                    self.pending_buys.len(),
                    max_positions
                ),
            ));
        }

        Ok(())
    }
}

/// Liquid capital after a run must equal liquid capital before it plus the
/// cash flows of the run's trades.
pub fn verify_cash_flow(
    before: &PortfolioState,
    after: &PortfolioState,
    trades: &[Trade],
) -> Result<(), LivebookError> {
    let flows: f64 = trades.iter().map(Trade::cash_flow).sum();
    let expected = before.liquid_capital() + flows;
    let actual = after.liquid_capital();
    let tolerance = CASH_EPSILON * expected.abs().max(1.0);
    if (expected - actual).abs() > tolerance {
        return Err(LivebookError::invariant(
            "run",
            "capital_conservation",
            format!("expected liquid capital {:.6}, found {:.6}", expected, actual),
        ));
    }
    Ok(())
}
