//! Durable portfolio state and ledger port.

use crate::domain::error::LivebookError;
use crate::domain::portfolio::{EquityPoint, PortfolioState};
use crate::domain::position::Trade;

/// Held for the duration of a run; dropping it releases the store.
pub trait RunGuard {}

pub trait StateStore {
    /// Acquire the exclusive run lock. Fails with `LockHeld` if another run owns it.
    fn lock(&self) -> Result<Box<dyn RunGuard + '_>, LivebookError>;

    /// The last committed state, or `None` before the first run.
    fn load(&self) -> Result<Option<PortfolioState>, LivebookError>;

    /// Persist `state` and append the run's ledger rows as one commit.
    fn commit(
        &self,
        state: &PortfolioState,
        trades: &[Trade],
        equity: &EquityPoint,
    ) -> Result<(), LivebookError>;

    fn read_trades(&self) -> Result<Vec<Trade>, LivebookError>;

    fn read_equity(&self) -> Result<Vec<EquityPoint>, LivebookError>;
}
