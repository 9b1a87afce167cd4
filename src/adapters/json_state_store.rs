//! Directory-backed state store.
//!
//! Layout:
//! - `state.json`: the committed [`PortfolioState`]
//! - `trades.csv`, `equity.csv`: append-only ledgers
//! - `run.lock`: present while a run holds the store
//!
//! Every file is replaced by writing a `.tmp` sibling and renaming it into
//! place. Ledgers are written first and `state.json` last, so the state file
//! is the commit point: ledger rows dated after the committed
//! `last_processed_date` can only be leftovers of a crashed commit and are
//! dropped on rewrite.

use crate::domain::error::LivebookError;
use crate::domain::portfolio::{EquityPoint, PortfolioState};
use crate::domain::position::Trade;
use crate::ports::state_port::{RunGuard, StateStore};
use chrono::{NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

const STATE_FILE: &str = "state.json";
const TRADES_FILE: &str = "trades.csv";
const EQUITY_FILE: &str = "equity.csv";
const LOCK_FILE: &str = "run.lock";

pub struct JsonStateStore {
    dir: PathBuf,
}

/// Removes `run.lock` when dropped.
pub struct LockFile {
    path: PathBuf,
}

impl RunGuard for LockFile {}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove run lock");
        }
    }
}

impl JsonStateStore {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Write `bytes` to a temp sibling, fsync, then rename over `path`.
fn replace_file(path: &Path, bytes: &[u8]) -> Result<(), LivebookError> {
    let tmp = tmp_path(path);
    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        LivebookError::Io(e)
    })
}

fn ledger_error(path: &Path, e: impl std::fmt::Display) -> LivebookError {
    LivebookError::Ledger {
        path: path.display().to_string(),
        reason: e.to_string(),
    }
}

fn read_ledger<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, LivebookError> {
    let mut rdr = match csv::Reader::from_path(path) {
        Ok(rdr) => rdr,
        Err(e) => {
            if let csv::ErrorKind::Io(io) = e.kind()
                && io.kind() == ErrorKind::NotFound
            {
                return Ok(Vec::new());
            }
            return Err(ledger_error(path, e));
        }
    };
    rdr.deserialize()
        .collect::<Result<Vec<T>, _>>()
        .map_err(|e| ledger_error(path, e))
}

/// Rewrite a ledger: rows covered by `committed`, then `rows`.
fn rewrite_ledger<T, F>(
    path: &Path,
    committed: Option<NaiveDate>,
    row_date: F,
    rows: &[T],
) -> Result<(), LivebookError>
where
    T: Serialize + DeserializeOwned,
    F: Fn(&T) -> NaiveDate,
{
    let existing: Vec<T> = read_ledger(path)?;
    let before = existing.len();
    let kept: Vec<T> = existing
        .into_iter()
        .filter(|r| committed.is_some_and(|c| row_date(r) <= c))
        .collect();
    if kept.len() != before {
        debug!(path = %path.display(), dropped = before - kept.len(), "dropping orphan ledger rows");
    }

    let mut wtr = csv::Writer::from_writer(Vec::new());
    for row in kept.iter().chain(rows) {
        wtr.serialize(row).map_err(|e| ledger_error(path, e))?;
    }
    let bytes = wtr.into_inner().map_err(|e| ledger_error(path, e))?;
    replace_file(path, &bytes)
}

impl StateStore for JsonStateStore {
    fn lock(&self) -> Result<Box<dyn RunGuard + '_>, LivebookError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(LOCK_FILE);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let owner = fs::read_to_string(&path).unwrap_or_default();
                return Err(LivebookError::LockHeld {
                    path: path.display().to_string(),
                    owner: owner.trim().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        };
        let guard = LockFile { path };
        writeln!(
            file,
            "pid={} acquired={}",
            std::process::id(),
            Utc::now().to_rfc3339()
        )?;
        debug!(path = %guard.path.display(), "run lock acquired");
        Ok(Box::new(guard))
    }

    fn load(&self) -> Result<Option<PortfolioState>, LivebookError> {
        let path = self.path(STATE_FILE);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| LivebookError::StateCorrupt {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
    }

    fn commit(
        &self,
        state: &PortfolioState,
        trades: &[Trade],
        equity: &EquityPoint,
    ) -> Result<(), LivebookError> {
        fs::create_dir_all(&self.dir)?;
        let date = equity.date;
        let committed = self.committed_date()?;

        rewrite_ledger(&self.path(TRADES_FILE), committed, |t: &Trade| t.date, trades)?;
        rewrite_ledger(
            &self.path(EQUITY_FILE),
            committed,
            |p: &EquityPoint| p.date,
            std::slice::from_ref(equity),
        )?;

        let path = self.path(STATE_FILE);
        let json = serde_json::to_string_pretty(state).map_err(|e| LivebookError::StateCorrupt {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        replace_file(&path, json.as_bytes())?;
        debug!(dir = %self.dir.display(), %date, "state committed");
        Ok(())
    }

    fn read_trades(&self) -> Result<Vec<Trade>, LivebookError> {
        let committed = self.committed_date()?;
        let rows: Vec<Trade> = read_ledger(&self.path(TRADES_FILE))?;
        Ok(rows
            .into_iter()
            .filter(|t| committed.is_some_and(|c| t.date <= c))
            .collect())
    }

    fn read_equity(&self) -> Result<Vec<EquityPoint>, LivebookError> {
        let committed = self.committed_date()?;
        let rows: Vec<EquityPoint> = read_ledger(&self.path(EQUITY_FILE))?;
        Ok(rows
            .into_iter()
            .filter(|p| committed.is_some_and(|c| p.date <= c))
            .collect())
    }
}

impl JsonStateStore {
    /// Readers only see ledger rows covered by the committed state.
    fn committed_date(&self) -> Result<Option<NaiveDate>, LivebookError> {
        Ok(self.load()?.and_then(|s| s.last_processed_date))
    }
}
