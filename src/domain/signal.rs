//! Signal selection: turn today's ranking into tomorrow's pending buys.

use tracing::info;

use super::events::RunEvent;
use super::market::MarketView;
use super::portfolio::{PendingBuy, PortfolioState};

#[derive(Debug, Clone, PartialEq)]
pub struct SelectorConfig {
    pub max_positions: usize,
    pub min_ticket_size: f64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        SelectorConfig {
            max_positions: 5,
            min_ticket_size: 1000.0,
        }
    }
}

/// Orders the selector wants to queue, before any cash moves.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SignalPlan {
    pub buys: Vec<PendingBuy>,
    pub events: Vec<RunEvent>,
}

impl SignalPlan {
    /// Reserve each order's capital out of free cash and queue it.
    pub fn apply(self, state: &mut PortfolioState) -> Vec<RunEvent> {
        for order in self.buys {
            state.cash -= order.planned_capital;
            state.pending_buys.push(order);
        }
        self.events
    }
}

/// Pick candidates for the free slots and size them equally from free cash.
///
/// The free cash is split across every free slot, not just the slots that
/// found a candidate, so a thin ranking never concentrates capital.
pub fn plan_buys(state: &PortfolioState, view: &MarketView, config: &SelectorConfig) -> SignalPlan {
    let free_slots = config.max_positions.saturating_sub(state.used_slots());
    if free_slots == 0 {
        return SignalPlan::default();
    }

    let per_slot = state.cash / free_slots as f64;
    if !(per_slot.is_finite() && per_slot >= config.min_ticket_size && per_slot > 0.0) {
        info!(
            free_slots,
            per_slot, min_ticket = config.min_ticket_size, "signals suppressed"
        );
        return SignalPlan {
            buys: Vec::new(),
            events: vec![RunEvent::SignalSuppressed {
                free_slots,
                per_slot_capital: per_slot,
                min_ticket_size: config.min_ticket_size,
            }],
        };
    }

    let buys: Vec<PendingBuy> = view
        .ranked()
        .into_iter()
        .filter(|b| !state.has_position(&b.symbol) && !state.has_pending_buy(&b.symbol))
        .take(free_slots)
        .map(|b| PendingBuy {
            symbol: b.symbol.clone(),
            planned_capital: per_slot,
            decision_date: view.date(),
            deferrals: 0,
        })
        .collect();

    for order in &buys {
        info!(symbol = %order.symbol, planned_capital = order.planned_capital, "signal queued");
    }
    SignalPlan {
        buys,
        events: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::MarketBar;
    use crate::domain::position::Position;
    use chrono::NaiveDate;

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 6, 3).unwrap()
    }

    fn bar(symbol: &str, score: f64) -> MarketBar {
        MarketBar {
            symbol: symbol.into(),
            date: day(),
            open: 10.0,
            high: 10.5,
            low: 9.5,
            close: 10.0,
            volume: 100,
            model_score: score,
            rs_rank: None,
        }
    }

    fn view() -> MarketView {
        MarketView::new(
            day(),
            vec![
                bar("A", 0.9),
                bar("B", 0.8),
                bar("C", 0.7),
                bar("D", 0.6),
                bar("E", 0.5),
                bar("F", 0.4),
                bar("X", f64::NAN),
            ],
        )
        .unwrap()
    }

    fn holding(symbol: &str) -> Position {
        Position {
            symbol: symbol.into(),
            shares: 1,
            entry_price: 10.0,
            entry_date: day(),
            entry_commission: 0.0,
            days_held: 1,
            last_known_price: 10.0,
            stagnant_sessions: 0,
            pending_exit: None,
        }
    }

    #[test]
    fn empty_portfolio_fills_every_slot_equally() {
        let state = PortfolioState::new(100_000.0);
        let plan = plan_buys(&state, &view(), &SelectorConfig::default());
        let symbols: Vec<&str> = plan.buys.iter().map(|o| o.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["A", "B", "C", "D", "E"]);
        for o in &plan.buys {
            assert!((o.planned_capital - 20_000.0).abs() < 1e-9);
            assert_eq!(o.decision_date, day());
        }
    }

    #[test]
    fn skips_held_and_pending_symbols() {
        let mut state = PortfolioState::new(30_000.0);
        state.add_position(holding("A"));
        state.pending_buys.push(PendingBuy {
            symbol: "B".into(),
            planned_capital: 10_000.0,
            decision_date: day(),
            deferrals: 0,
        });
        let plan = plan_buys(&state, &view(), &SelectorConfig::default());
        let symbols: Vec<&str> = plan.buys.iter().map(|o| o.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["C", "D", "E"]);
        assert!((plan.buys[0].planned_capital - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn position_with_queued_exit_still_uses_a_slot() {
        let mut state = PortfolioState::new(0.0);
        for s in ["A", "B", "C", "D", "E"] {
            state.add_position(holding(s));
        }
        state.cash = 50_000.0;
        assert!(plan_buys(&state, &view(), &SelectorConfig::default()).buys.is_empty());
    }

    #[test]
    fn below_min_ticket_emits_nothing() {
        let state = PortfolioState::new(4_000.0);
        let plan = plan_buys(&state, &view(), &SelectorConfig::default());
        assert!(plan.buys.is_empty());
        assert!(matches!(
            plan.events[0],
            RunEvent::SignalSuppressed { free_slots: 5, .. }
        ));
    }

    #[test]
    fn thin_ranking_still_divides_by_free_slots() {
        let thin = MarketView::new(day(), vec![bar("A", 0.9)]).unwrap();
        let state = PortfolioState::new(50_000.0);
        let plan = plan_buys(&state, &thin, &SelectorConfig::default());
        assert_eq!(plan.buys.len(), 1);
        assert!((plan.buys[0].planned_capital - 10_000.0).abs() < 1e-9);
    }

    #[test]
    fn apply_moves_cash_into_reservation() {
        let mut state = PortfolioState::new(100_000.0);
        let plan = plan_buys(&state, &view(), &SelectorConfig::default());
        let events = plan.apply(&mut state);
        assert!(events.is_empty());
        assert!(state.cash.abs() < 1e-6);
        assert!((state.reserved_capital() - 100_000.0).abs() < 1e-6);
        assert_eq!(state.used_slots(), 5);
    }
}
