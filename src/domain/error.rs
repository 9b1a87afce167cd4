//! Domain error types.

/// Top-level error type for livebook.
///
/// Every variant is fatal for the run that produced it: nothing is committed
/// and the persisted state is left as it was. Benign outcomes (a date that was
/// already processed, a skipped buy) are reported through
/// [`RunStatus`](crate::domain::run::RunStatus) and
/// [`RunEvent`](crate::domain::events::RunEvent) instead.
#[derive(Debug, thiserror::Error)]
pub enum LivebookError {
    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error("market data error: {reason}")]
    MarketData { reason: String },

    #[error("no market data for {date}")]
    NoMarketData { date: chrono::NaiveDate },

    #[error("state file {path} is corrupt: {reason}")]
    StateCorrupt { path: String, reason: String },

    #[error("ledger error in {path}: {reason}")]
    Ledger { path: String, reason: String },

    #[error("run lock {path} is held by another run ({owner})")]
    LockHeld { path: String, owner: String },

    #[error("invariant violated in {component}: {invariant} ({detail})")]
    InvariantViolation {
        component: &'static str,
        invariant: &'static str,
        detail: String,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LivebookError {
    pub(crate) fn invariant(
        component: &'static str,
        invariant: &'static str,
        detail: impl Into<String>,
    ) -> Self {
        LivebookError::InvariantViolation {
            component,
            invariant,
            detail: detail.into(),
        }
    }
}

impl From<&LivebookError> for std::process::ExitCode {
    fn from(err: &LivebookError) -> Self {
        let code: u8 = match err {
            LivebookError::Io(_) => 1,
            LivebookError::ConfigParse { .. }
            | LivebookError::ConfigMissing { .. }
            | LivebookError::ConfigInvalid { .. } => 2,
            LivebookError::MarketData { .. } | LivebookError::NoMarketData { .. } => 3,
            LivebookError::StateCorrupt { .. } | LivebookError::Ledger { .. } => 4,
            LivebookError::LockHeld { .. } => 5,
            LivebookError::InvariantViolation { .. } => 6,
        };
        std::process::ExitCode::from(code)
    }
}
