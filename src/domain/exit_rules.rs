//! Exit rule evaluation.
//!
//! Each open position is checked against the rules in [`ExitReason::PRECEDENCE`]
//! order and the first rule that fires becomes the position's exit decision.
//! Decisions are made on today's bar and settled by the next run.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use super::market::{MarketBar, MarketView};
use super::position::Position;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    StopLoss,
    TimeExit,
    PerformanceFailure,
    Stagnation,
    TakeProfit,
}

impl ExitReason {
    /// Evaluation order. Stop-loss must stay first.
    pub const PRECEDENCE: [ExitReason; 5] = [
        ExitReason::StopLoss,
        ExitReason::TimeExit,
        ExitReason::PerformanceFailure,
        ExitReason::Stagnation,
        ExitReason::TakeProfit,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TimeExit => "TIME_EXIT",
            ExitReason::PerformanceFailure => "PERFORMANCE_FAILURE",
            ExitReason::Stagnation => "STAGNATION",
            ExitReason::TakeProfit => "TAKE_PROFIT",
        }
    }

    /// Whether the probation period (`min_hold_days`) applies to this rule.
    pub fn respects_probation(self) -> bool {
        !matches!(self, ExitReason::StopLoss)
    }

    fn check(self, position: &Position, ctx: &ExitContext<'_>, rules: &ExitRules) -> Option<ExitPrice> {
        match self {
            ExitReason::StopLoss => check_stop_loss(position, ctx.bar, rules),
            ExitReason::TimeExit => check_time_exit(position, rules),
            ExitReason::PerformanceFailure => check_performance_failure(position, ctx, rules),
            ExitReason::Stagnation => check_stagnation(position, rules),
            ExitReason::TakeProfit => check_take_profit(position, ctx, rules),
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Price at which a decided exit settles.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "price", rename_all = "snake_case")]
pub enum ExitPrice {
    /// Fill at exactly this price (stop orders).
    Limit(f64),
    /// Fill at the settling session's open, after sell slippage.
    NextOpen,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitDecision {
    pub symbol: String,
    pub reason: ExitReason,
    pub target: ExitPrice,
    pub decided_on: NaiveDate,
}

/// Thresholds for the exit rules. Percentages are fractions.
#[derive(Debug, Clone, PartialEq)]
pub struct ExitRules {
    /// 0 disables the stop.
    pub stop_loss_pct: f64,
    /// 0 disables the time exit.
    pub max_hold_days: u32,
    /// Sessions during which only the stop-loss may fire.
    pub min_hold_days: u32,
    pub min_eval_days: u32,
    pub failure_threshold: f64,
    /// 0 disables the stagnation exit.
    pub stagnation_days: u32,
    /// Close-to-close move below which a session counts as flat. The entry
    /// session is never sampled.
    pub stagnation_band: f64,
    /// 0 disables the take-profit exit.
    pub take_profit_pct: f64,
    /// Size of the top-ranked set a take-profit candidate must have left.
    pub top_k: usize,
}

impl Default for ExitRules {
    fn default() -> Self {
        ExitRules {
            stop_loss_pct: 0.05,
            max_hold_days: 20,
            min_hold_days: 0,
            min_eval_days: 8,
            failure_threshold: 0.2,
            stagnation_days: 3,
            stagnation_band: 0.01,
            take_profit_pct: 0.10,
            top_k: 5,
        }
    }
}

/// Market facts about one position's symbol on the evaluation day.
#[derive(Debug, Clone)]
pub struct ExitContext<'a> {
    pub bar: &'a MarketBar,
    pub relative_strength: Option<f64>,
    pub in_top_set: bool,
}

fn check_stop_loss(position: &Position, bar: &MarketBar, rules: &ExitRules) -> Option<ExitPrice> {
    if rules.stop_loss_pct <= 0.0 {
        return None;
    }
    let stop = position.stop_level(rules.stop_loss_pct);
    let worst = bar.low_or_close();
    if !(worst.is_finite() && worst > 0.0) || worst > stop {
        return None;
    }
    // A gap below the stop can only be filled at the open.
    if bar.open.is_finite() && bar.open > 0.0 && bar.open < stop {
        Some(ExitPrice::Limit(bar.open))
    } else {
        Some(ExitPrice::Limit(stop))
    }
}

fn check_time_exit(position: &Position, rules: &ExitRules) -> Option<ExitPrice> {
    (rules.max_hold_days > 0 && position.days_held >= rules.max_hold_days)
        .then_some(ExitPrice::NextOpen)
}

fn check_performance_failure(
    position: &Position,
    ctx: &ExitContext<'_>,
    rules: &ExitRules,
) -> Option<ExitPrice> {
    if position.days_held < rules.min_eval_days {
        return None;
    }
    let rank = ctx.relative_strength?;
    (rank < rules.failure_threshold).then_some(ExitPrice::NextOpen)
}

fn check_stagnation(position: &Position, rules: &ExitRules) -> Option<ExitPrice> {
    (rules.stagnation_days > 0 && position.stagnant_sessions >= rules.stagnation_days)
        .then_some(ExitPrice::NextOpen)
}

fn check_take_profit(
    position: &Position,
    ctx: &ExitContext<'_>,
    rules: &ExitRules,
) -> Option<ExitPrice> {
    if rules.take_profit_pct <= 0.0 || ctx.in_top_set {
        return None;
    }
    (position.unrealized_return(ctx.bar.close) >= rules.take_profit_pct)
        .then_some(ExitPrice::NextOpen)
}

/// Decide whether `position` exits. At most one decision, first match wins.
pub fn evaluate(
    position: &Position,
    ctx: &ExitContext<'_>,
    rules: &ExitRules,
    today: NaiveDate,
) -> Option<ExitDecision> {
    ExitReason::PRECEDENCE
        .iter()
        .filter(|r| !(r.respects_probation() && position.days_held < rules.min_hold_days))
        .find_map(|&reason| {
            reason.check(position, ctx, rules).map(|target| ExitDecision {
                symbol: position.symbol.clone(),
                reason,
                target,
                decided_on: today,
            })
        })
}

/// Evaluate every open position that has a usable close today and no exit
/// queued yet. A bar without one is a data gap, not a price.
pub fn scan<'a>(
    positions: impl IntoIterator<Item = &'a Position>,
    view: &MarketView,
    rules: &ExitRules,
) -> Vec<ExitDecision> {
    let top: HashSet<String> = view.top_symbols(rules.top_k);
    let mut decisions: BTreeMap<String, ExitDecision> = BTreeMap::new();

    for position in positions {
        if position.pending_exit.is_some() {
            continue;
        }
        let Some(bar) = view.get(&position.symbol).filter(|b| b.has_usable_close()) else {
            continue;
        };
        let ctx = ExitContext {
            bar,
            relative_strength: view.relative_strength(&position.symbol),
            in_top_set: top.contains(&position.symbol),
        };
        if let Some(decision) = evaluate(position, &ctx, rules, view.date()) {
            decisions.insert(decision.symbol.clone(), decision);
        }
    }

    decisions.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
    }

    fn position(days_held: u32) -> Position {
        Position {
            symbol: "KCHOL".into(),
            shares: 10,
            entry_price: 100.0,
            entry_date: NaiveDate::from_ymd_opt(2024, 1, 10).unwrap(),
            entry_commission: 0.0,
            days_held,
            last_known_price: 100.0,
            stagnant_sessions: 0,
            pending_exit: None,
        }
    }

    fn bar(open: f64, low: f64, close: f64) -> MarketBar {
        MarketBar {
            symbol: "KCHOL".into(),
            date: today(),
            open,
            high: open.max(close) + 1.0,
            low,
            close,
            volume: 5_000,
            model_score: 0.3,
            rs_rank: None,
        }
    }

    fn ctx(bar: &MarketBar) -> ExitContext<'_> {
        ExitContext {
            bar,
            relative_strength: Some(0.5),
            in_top_set: true,
        }
    }

    #[test]
    fn holds_when_nothing_fires() {
        let b = bar(100.0, 99.0, 101.0);
        assert!(evaluate(&position(2), &ctx(&b), &ExitRules::default(), today()).is_none());
    }

    #[test]
    fn stop_loss_targets_the_threshold_not_the_close() {
        let b = bar(99.0, 94.0, 96.0);
        let d = evaluate(&position(2), &ctx(&b), &ExitRules::default(), today()).unwrap();
        assert_eq!(d.reason, ExitReason::StopLoss);
        match d.target {
            ExitPrice::Limit(p) => assert!((p - 95.0).abs() < 1e-9),
            other => panic!("expected limit, got {:?}", other),
        }
    }

    #[test]
    fn stop_loss_triggers_on_close_at_threshold() {
        let b = bar(99.0, f64::NAN, 95.0);
        let d = evaluate(&position(2), &ctx(&b), &ExitRules::default(), today()).unwrap();
        assert_eq!(d.reason, ExitReason::StopLoss);
    }

    #[test]
    fn gap_below_stop_targets_the_open() {
        let b = bar(90.0, 88.0, 91.0);
        let d = evaluate(&position(2), &ctx(&b), &ExitRules::default(), today()).unwrap();
        assert_eq!(d.target, ExitPrice::Limit(90.0));
    }

    #[test]
    fn stop_loss_disabled_at_zero() {
        let rules = ExitRules {
            stop_loss_pct: 0.0,
            ..ExitRules::default()
        };
        let b = bar(50.0, 40.0, 45.0);
        let c = ExitContext {
            bar: &b,
            relative_strength: Some(0.9),
            in_top_set: true,
        };
        assert!(evaluate(&position(1), &c, &rules, today()).is_none());
    }

    #[test]
    fn stop_loss_beats_take_profit_on_the_same_day() {
        let rules = ExitRules {
            take_profit_pct: 0.10,
            ..ExitRules::default()
        };
        // Closes +15% after trading through the stop intraday.
        let b = bar(100.0, 90.0, 115.0);
        let c = ExitContext {
            bar: &b,
            relative_strength: Some(0.9),
            in_top_set: false,
        };
        let d = evaluate(&position(3), &c, &rules, today()).unwrap();
        assert_eq!(d.reason, ExitReason::StopLoss);
    }

    #[test]
    fn time_exit_at_max_hold() {
        let b = bar(100.0, 99.0, 101.0);
        let d = evaluate(&position(20), &ctx(&b), &ExitRules::default(), today()).unwrap();
        assert_eq!(d.reason, ExitReason::TimeExit);
        assert_eq!(d.target, ExitPrice::NextOpen);
        assert!(evaluate(&position(19), &ctx(&b), &ExitRules::default(), today()).is_none());
    }

    #[test]
    fn performance_failure_needs_min_eval_days() {
        let b = bar(100.0, 99.0, 101.0);
        let weak = ExitContext {
            bar: &b,
            relative_strength: Some(0.1),
            in_top_set: true,
        };
        assert!(evaluate(&position(7), &weak, &ExitRules::default(), today()).is_none());
        let d = evaluate(&position(8), &weak, &ExitRules::default(), today()).unwrap();
        assert_eq!(d.reason, ExitReason::PerformanceFailure);
    }

    #[test]
    fn performance_failure_wins_over_stagnation() {
        let b = bar(100.0, 99.5, 100.2);
        let weak = ExitContext {
            bar: &b,
            relative_strength: Some(0.1),
            in_top_set: true,
        };
        let mut pos = position(9);
        pos.stagnant_sessions = 5;
        let d = evaluate(&pos, &weak, &ExitRules::default(), today()).unwrap();
        assert_eq!(d.reason, ExitReason::PerformanceFailure);
    }

    #[test]
    fn stagnation_after_consecutive_flat_sessions() {
        let b = bar(100.0, 99.5, 100.2);
        let mut pos = position(4);
        pos.stagnant_sessions = 2;
        assert!(evaluate(&pos, &ctx(&b), &ExitRules::default(), today()).is_none());
        pos.stagnant_sessions = 3;
        let d = evaluate(&pos, &ctx(&b), &ExitRules::default(), today()).unwrap();
        assert_eq!(d.reason, ExitReason::Stagnation);
    }

    #[test]
    fn take_profit_only_after_leaving_top_set() {
        let b = bar(108.0, 107.0, 112.0);
        let still_top = ctx(&b);
        assert!(evaluate(&position(5), &still_top, &ExitRules::default(), today()).is_none());

        let dropped = ExitContext {
            bar: &b,
            relative_strength: Some(0.5),
            in_top_set: false,
        };
        let d = evaluate(&position(5), &dropped, &ExitRules::default(), today()).unwrap();
        assert_eq!(d.reason, ExitReason::TakeProfit);
    }

    #[test]
    fn probation_suppresses_all_but_stop_loss() {
        let rules = ExitRules {
            min_hold_days: 8,
            max_hold_days: 2,
            ..ExitRules::default()
        };
        let calm = bar(100.0, 99.0, 101.0);
        assert!(evaluate(&position(3), &ctx(&calm), &rules, today()).is_none());

        let crash = bar(100.0, 90.0, 92.0);
        let d = evaluate(&position(3), &ctx(&crash), &rules, today()).unwrap();
        assert_eq!(d.reason, ExitReason::StopLoss);
    }

    #[test]
    fn precedence_starts_with_stop_loss() {
        assert_eq!(ExitReason::PRECEDENCE[0], ExitReason::StopLoss);
        assert_eq!(ExitReason::PRECEDENCE.len(), 5);
    }

    #[test]
    fn reason_serializes_screaming_snake() {
        let json = serde_json::to_string(&ExitReason::PerformanceFailure).unwrap();
        assert_eq!(json, "\"PERFORMANCE_FAILURE\"");
        assert_eq!(ExitReason::TakeProfit.to_string(), "TAKE_PROFIT");
    }

    #[test]
    fn scan_skips_missing_symbols_and_queued_exits() {
        let b = bar(90.0, 88.0, 91.0);
        let view = MarketView::new(today(), vec![b]).unwrap();

        let hit = position(2);
        let mut queued = position(2);
        queued.pending_exit = Some(ExitDecision {
            symbol: "KCHOL".into(),
            reason: ExitReason::TimeExit,
            target: ExitPrice::NextOpen,
            decided_on: today(),
        });
        let mut missing = position(2);
        missing.symbol = "GONE".into();

        assert_eq!(scan([&hit], &view, &ExitRules::default()).len(), 1);
        assert!(scan([&queued, &missing], &view, &ExitRules::default()).is_empty());
    }

    #[test]
    fn blank_prices_never_trigger_a_stop() {
        let blank = bar(f64::NAN, f64::NAN, f64::NAN);
        assert!(evaluate(&position(2), &ctx(&blank), &ExitRules::default(), today()).is_none());

        let zeroed = bar(0.0, 0.0, 0.0);
        assert!(evaluate(&position(2), &ctx(&zeroed), &ExitRules::default(), today()).is_none());
    }

    #[test]
    fn scan_treats_a_halted_bar_as_a_gap() {
        let mut halted = bar(f64::NAN, f64::NAN, f64::NAN);
        halted.symbol = "HALT".into();
        let view = MarketView::new(today(), vec![halted]).unwrap();

        let mut old = position(30);
        old.symbol = "HALT".into();
        old.stagnant_sessions = 10;
        assert!(scan([&old], &view, &ExitRules::default()).is_empty());
    }
}
