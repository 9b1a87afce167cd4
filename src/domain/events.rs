//! Informational run events: non-fatal things a caller may want to see.

use serde::Serialize;
use std::fmt;

use super::exit_rules::ExitReason;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BuySkipReason {
    /// Planned capital does not cover one share at today's open.
    ZeroShares { planned_capital: f64, price: f64 },
    /// The bar is present but its open cannot be filled against.
    Untradable,
    /// The symbol was missing from the feed too many runs in a row.
    DeferralLimit,
    /// A position in the symbol already exists.
    AlreadyHeld,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    BuySkipped {
        symbol: String,
        reason: BuySkipReason,
    },
    BuyDeferred {
        symbol: String,
        deferrals: u32,
    },
    ExitDeferred {
        symbol: String,
        reason: ExitReason,
    },
    PositionStale {
        symbol: String,
    },
    ExitDecided {
        symbol: String,
        reason: ExitReason,
    },
    SignalSuppressed {
        free_slots: usize,
        per_slot_capital: f64,
        min_ticket_size: f64,
    },
}

impl fmt::Display for RunEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunEvent::BuySkipped { symbol, reason } => match reason {
                BuySkipReason::ZeroShares {
                    planned_capital,
                    price,
                } => write!(
                    f,
                    "{}: buy skipped, {:.2} does not cover one share at {:.2}",
                    symbol, planned_capital, price
                ),
                BuySkipReason::Untradable => write!(f, "{}: buy skipped, no tradable open", symbol),
                BuySkipReason::DeferralLimit => {
                    write!(f, "{}: buy dropped after repeated data gaps", symbol)
                }
                BuySkipReason::AlreadyHeld => write!(f, "{}: buy skipped, already held", symbol),
            },
            RunEvent::BuyDeferred { symbol, deferrals } => {
                write!(f, "{}: no bar, buy deferred ({})", symbol, deferrals)
            }
            RunEvent::ExitDeferred { symbol, reason } => {
                write!(f, "{}: no bar, {} exit deferred", symbol, reason)
            }
            RunEvent::PositionStale { symbol } => {
                write!(f, "{}: no bar, position left unchanged", symbol)
            }
            RunEvent::ExitDecided { symbol, reason } => {
                write!(f, "{}: {} queued for next session", symbol, reason)
            }
            RunEvent::SignalSuppressed {
                free_slots,
                per_slot_capital,
                min_ticket_size,
            } => write!(
                f,
                "{} free slots left empty: {:.2} per slot is below minimum ticket {:.2}",
                free_slots, per_slot_capital, min_ticket_size
            ),
        }
    }
}
