//! Open positions and trade ledger rows.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::exit_rules::{ExitDecision, ExitReason};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub shares: u64,
    pub entry_price: f64,
    pub entry_date: NaiveDate,
    pub entry_commission: f64,
    pub days_held: u32,
    pub last_known_price: f64,
    /// Consecutive sessions whose close moved less than the stagnation band.
    #[serde(default)]
    pub stagnant_sessions: u32,
    /// Exit decided by the previous run, settled by the next one.
    #[serde(default)]
    pub pending_exit: Option<ExitDecision>,
}

impl Position {
    pub fn market_value(&self) -> f64 {
        self.shares as f64 * self.last_known_price
    }

    pub fn cost_basis(&self) -> f64 {
        self.shares as f64 * self.entry_price
    }

    /// Fractional return of `price` over the entry price.
    pub fn unrealized_return(&self, price: f64) -> f64 {
        if self.entry_price > 0.0 {
            price / self.entry_price - 1.0
        } else {
            0.0
        }
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        self.shares as f64 * (price - self.entry_price)
    }

    /// entry_price * (1 - stop_loss_pct)
    pub fn stop_level(&self, stop_loss_pct: f64) -> f64 {
        self.entry_price * (1.0 - stop_loss_pct)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Buy,
    Sell,
}

/// Append-only trade ledger row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub date: NaiveDate,
    pub symbol: String,
    pub side: Side,
    pub shares: u64,
    pub price: f64,
    pub commission: f64,
    pub reason: Option<ExitReason>,
    pub entry_price: f64,
    pub entry_date: NaiveDate,
    pub days_held: u32,
    pub realized_pnl: Option<f64>,
}

impl Trade {
    pub fn notional(&self) -> f64 {
        self.shares as f64 * self.price
    }

    /// Signed effect of the trade on cash.
    pub fn cash_flow(&self) -> f64 {
        match self.side {
            Side::Buy => -(self.notional() + self.commission),
            Side::Sell => self.notional() - self.commission,
        }
    }

    /// Sell return net of both legs' commissions, as a fraction of entry cost.
    pub fn return_pct(&self) -> Option<f64> {
        let pnl = self.realized_pnl?;
        let cost = self.shares as f64 * self.entry_price;
        if cost > 0.0 { Some(pnl / cost) } else { None }
    }
}
