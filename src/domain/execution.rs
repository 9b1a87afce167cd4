//! Trade execution and fill simulation.
//!
//! Settles exits decided by the previous run, fills yesterday's pending buys
//! at today's open, then marks the surviving positions to today's close.
//! A symbol missing from today's view is deferred, never fatal.

use chrono::NaiveDate;
use tracing::{debug, info};

use super::error::LivebookError;
use super::events::{BuySkipReason, RunEvent};
use super::exit_rules::{ExitPrice, ExitReason};
use super::market::MarketView;
use super::portfolio::{PendingBuy, PortfolioState};
use super::position::{Position, Side, Trade};

/// Execution costs and data-gap tolerance. Percentages are fractions.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionConfig {
    pub commission_pct: f64,
    pub slippage_buy_pct: f64,
    pub slippage_sell_pct: f64,
    /// Runs a pending buy may wait for a missing bar before it is dropped.
    pub max_buy_deferrals: u32,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        ExecutionConfig {
            commission_pct: 0.002,
            slippage_buy_pct: 0.0,
            slippage_sell_pct: 0.0,
            max_buy_deferrals: 2,
        }
    }
}

/// Trades and events produced by one day's settlement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settlement {
    pub trades: Vec<Trade>,
    pub events: Vec<RunEvent>,
}

/// trade_value * commission_pct
pub fn calculate_commission(trade_value: f64, config: &ExecutionConfig) -> f64 {
    trade_value * config.commission_pct
}

/// Buy fill: market_price * (1 + slippage_pct)
pub fn apply_slippage_entry(market_price: f64, slippage_pct: f64) -> f64 {
    market_price * (1.0 + slippage_pct)
}

/// Sell fill: market_price * (1 - slippage_pct)
pub fn apply_slippage_exit(market_price: f64, slippage_pct: f64) -> f64 {
    market_price * (1.0 - slippage_pct)
}

/// Whole shares affordable with `capital` at `price`, commission included.
///
/// Starts from `floor(capital / price)` and steps down only when commission
/// would push the fill past the reservation.
pub fn shares_for(capital: f64, price: f64, config: &ExecutionConfig) -> u64 {
    if !(capital > 0.0 && price > 0.0) {
        return 0;
    }
    let shares = (capital / price).floor() as u64;
    let cost = shares as f64 * price;
    if cost + calculate_commission(cost, config) <= capital {
        shares
    } else {
        (capital / (price * (1.0 + config.commission_pct))).floor() as u64
    }
}

/// Run the full settlement for `view.date()`: exits, buys, price refresh.
pub fn settle_day(
    state: &mut PortfolioState,
    view: &MarketView,
    config: &ExecutionConfig,
    stagnation_band: f64,
) -> Result<Settlement, LivebookError> {
    let mut out = Settlement::default();
    settle_exits(state, view, config, &mut out);
    settle_pending_buys(state, view, config, &mut out)?;
    refresh_prices(state, view, stagnation_band, &mut out);
    Ok(out)
}

/// Convert pending buys into positions at today's open.
///
/// Each order spends only its own reservation; whatever it does not spend
/// returns to free cash.
pub fn settle_pending_buys(
    state: &mut PortfolioState,
    view: &MarketView,
    config: &ExecutionConfig,
    out: &mut Settlement,
) -> Result<(), LivebookError> {
    let today = view.date();
    let orders = std::mem::take(&mut state.pending_buys);
    let mut carried = Vec::new();

    for mut order in orders {
        if order.decision_date >= today {
            return Err(LivebookError::invariant(
                "execution",
                "t_plus_one",
                format!(
                    "{} decided {} cannot settle on {}",
                    order.symbol, order.decision_date, today
                ),
            ));
        }

        if state.has_position(&order.symbol) {
            release(state, order, BuySkipReason::AlreadyHeld, out);
            continue;
        }

        let Some(bar) = view.get(&order.symbol) else {
            order.deferrals += 1;
            if order.deferrals > config.max_buy_deferrals {
                release(state, order, BuySkipReason::DeferralLimit, out);
            } else {
                info!(symbol = %order.symbol, deferrals = order.deferrals, "no bar, buy deferred");
                out.events.push(RunEvent::BuyDeferred {
                    symbol: order.symbol.clone(),
                    deferrals: order.deferrals,
                });
                carried.push(order);
            }
            continue;
        };

        if !bar.has_tradable_open() {
            release(state, order, BuySkipReason::Untradable, out);
            continue;
        }

        let price = apply_slippage_entry(bar.open, config.slippage_buy_pct);
        let shares = shares_for(order.planned_capital, price, config);
        if shares == 0 {
            let reason = BuySkipReason::ZeroShares {
                planned_capital: order.planned_capital,
                price,
            };
            release(state, order, reason, out);
            continue;
        }

        let cost = shares as f64 * price;
        let commission = calculate_commission(cost, config);
        state.cash += order.planned_capital - cost - commission;

        debug!(symbol = %order.symbol, shares, price, "buy filled");
        state.add_position(Position {
            symbol: order.symbol.clone(),
            shares,
            entry_price: price,
            entry_date: today,
            entry_commission: commission,
            days_held: 0,
            last_known_price: price,
            stagnant_sessions: 0,
            pending_exit: None,
        });
        out.trades.push(Trade {
            date: today,
            symbol: order.symbol,
            side: Side::Buy,
            shares,
            price,
            commission,
            reason: None,
            entry_price: price,
            entry_date: today,
            days_held: 0,
            realized_pnl: None,
        });
    }

    state.pending_buys = carried;
    Ok(())
}

/// Drop a pending buy and hand its reservation back to free cash.
fn release(state: &mut PortfolioState, order: PendingBuy, reason: BuySkipReason, out: &mut Settlement) {
    info!(symbol = %order.symbol, reason = ?reason, "pending buy discarded");
    state.cash += order.planned_capital;
    out.events.push(RunEvent::BuySkipped {
        symbol: order.symbol,
        reason,
    });
}

/// Sell every position whose exit was decided by the previous run.
pub fn settle_exits(
    state: &mut PortfolioState,
    view: &MarketView,
    config: &ExecutionConfig,
    out: &mut Settlement,
) {
    let today = view.date();
    let queued: Vec<(String, ExitPrice, ExitReason)> = state
        .positions
        .values()
        .filter_map(|p| {
            p.pending_exit
                .as_ref()
                .map(|d| (p.symbol.clone(), d.target, d.reason))
        })
        .collect();

    for (symbol, target, reason) in queued {
        let fill = view.get(&symbol).and_then(|bar| match target {
            ExitPrice::Limit(price) if bar.traded() => Some(price),
            ExitPrice::Limit(_) => None,
            ExitPrice::NextOpen if bar.has_tradable_open() => {
                Some(apply_slippage_exit(bar.open, config.slippage_sell_pct))
            }
            ExitPrice::NextOpen => None,
        });

        let Some(price) = fill else {
            info!(symbol = %symbol, reason = %reason, "no fill price, exit deferred");
            out.events.push(RunEvent::ExitDeferred { symbol, reason });
            continue;
        };

        if let Some(position) = state.remove_position(&symbol) {
            let trade = close_position(position, price, today, config, reason);
            state.cash += trade.cash_flow();
            info!(
                symbol = %trade.symbol,
                reason = %reason,
                price = trade.price,
                pnl = trade.realized_pnl.unwrap_or_default(),
                "position closed"
            );
            out.trades.push(trade);
        }
    }
}

fn close_position(
    position: Position,
    price: f64,
    date: NaiveDate,
    config: &ExecutionConfig,
    reason: ExitReason,
) -> Trade {
    let proceeds = position.shares as f64 * price;
    let commission = calculate_commission(proceeds, config);
    let pnl = position.unrealized_pnl(price) - position.entry_commission - commission;
    Trade {
        date,
        symbol: position.symbol,
        side: Side::Sell,
        shares: position.shares,
        price,
        commission,
        reason: Some(reason),
        entry_price: position.entry_price,
        entry_date: position.entry_date,
        days_held: position.days_held,
        realized_pnl: Some(pnl),
    }
}

/// Mark open positions to today's close and advance their holding period.
pub fn refresh_prices(
    state: &mut PortfolioState,
    view: &MarketView,
    stagnation_band: f64,
    out: &mut Settlement,
) {
    for position in state.positions.values_mut() {
        let close = view
            .get(&position.symbol)
            .filter(|b| b.has_usable_close())
            .map(|b| b.close);
        let Some(close) = close else {
            out.events.push(RunEvent::PositionStale {
                symbol: position.symbol.clone(),
            });
            continue;
        };

        // The entry session has no previous close, only the fill price.
        if position.entry_date != view.date() {
            let prev = position.last_known_price;
            let moved = prev > 0.0 && (close / prev - 1.0).abs() >= stagnation_band;
            position.stagnant_sessions = if moved {
                0
            } else {
                position.stagnant_sessions + 1
            };
        }
        position.last_known_price = close;
        position.days_held += 1;
    }
}
