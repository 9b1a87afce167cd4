//! Configuration validation and engine config loading.
//!
//! Every numeric key is optional and falls back to its default, but a value
//! that is present must parse and sit in range. Nothing runs on a config that
//! fails here.

use crate::domain::error::LivebookError;
use crate::domain::execution::ExecutionConfig;
use crate::domain::exit_rules::ExitRules;
use crate::domain::run::EngineConfig;
use crate::domain::signal::SelectorConfig;
use crate::ports::config_port::ConfigPort;

pub fn validate_engine_config(config: &dyn ConfigPort) -> Result<(), LivebookError> {
    validate_portfolio(config)?;
    validate_selection(config)?;
    validate_risk(config)?;
    validate_execution(config)?;
    Ok(())
}

/// Validate, then build the engine config with defaults filled in.
pub fn load_engine_config(config: &dyn ConfigPort) -> Result<EngineConfig, LivebookError> {
    validate_engine_config(config)?;
    let defaults = EngineConfig::default();

    let max_positions = config.get_int(
        "selection",
        "max_positions",
        defaults.selector.max_positions as i64,
    ) as usize;
    let rules = &defaults.exit_rules;
    let exec = &defaults.execution;

    Ok(EngineConfig {
        initial_capital: config.get_double("portfolio", "initial_capital", defaults.initial_capital),
        selector: SelectorConfig {
            max_positions,
            min_ticket_size: config.get_double(
                "selection",
                "min_ticket_size",
                defaults.selector.min_ticket_size,
            ),
        },
        exit_rules: ExitRules {
            stop_loss_pct: config.get_double("risk", "stop_loss_pct", rules.stop_loss_pct),
            max_hold_days: config.get_int("risk", "max_hold_days", rules.max_hold_days as i64) as u32,
            min_hold_days: config.get_int("risk", "min_hold_days", rules.min_hold_days as i64) as u32,
            min_eval_days: config.get_int("risk", "min_eval_days", rules.min_eval_days as i64) as u32,
            failure_threshold: config.get_double("risk", "failure_threshold", rules.failure_threshold),
            stagnation_days: config.get_int("risk", "stagnation_days", rules.stagnation_days as i64)
                as u32,
            stagnation_band: config.get_double("risk", "stagnation_band", rules.stagnation_band),
            take_profit_pct: config.get_double("risk", "take_profit_pct", rules.take_profit_pct),
            top_k: config.get_int("selection", "top_k", max_positions as i64) as usize,
        },
        execution: ExecutionConfig {
            commission_pct: config.get_double("execution", "commission_pct", exec.commission_pct),
            slippage_buy_pct: config.get_double("execution", "slippage_buy_pct", exec.slippage_buy_pct),
            slippage_sell_pct: config.get_double(
                "execution",
                "slippage_sell_pct",
                exec.slippage_sell_pct,
            ),
            max_buy_deferrals: config.get_int(
                "execution",
                "max_buy_deferrals",
                exec.max_buy_deferrals as i64,
            ) as u32,
        },
    })
}

fn invalid(section: &str, key: &str, reason: impl Into<String>) -> LivebookError {
    LivebookError::ConfigInvalid {
        section: section.to_string(),
        key: key.to_string(),
        reason: reason.into(),
    }
}

/// The key's value as a float, `None` when absent.
fn number(config: &dyn ConfigPort, section: &str, key: &str) -> Result<Option<f64>, LivebookError> {
    match config.get_string(section, key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .map(Some)
            .ok_or_else(|| invalid(section, key, format!("'{}' is not a number", raw))),
    }
}

fn whole(config: &dyn ConfigPort, section: &str, key: &str) -> Result<Option<i64>, LivebookError> {
    match config.get_string(section, key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| invalid(section, key, format!("'{}' is not an integer", raw))),
    }
}

fn check_fraction(config: &dyn ConfigPort, section: &str, key: &str) -> Result<(), LivebookError> {
    if let Some(v) = number(config, section, key)?
        && !(0.0..1.0).contains(&v)
    {
        return Err(invalid(section, key, format!("{} must be in [0, 1)", key)));
    }
    Ok(())
}

fn check_non_negative_int(
    config: &dyn ConfigPort,
    section: &str,
    key: &str,
) -> Result<(), LivebookError> {
    if let Some(v) = whole(config, section, key)?
        && !(0..=i64::from(u32::MAX)).contains(&v)
    {
        return Err(invalid(section, key, format!("{} must be non-negative", key)));
    }
    Ok(())
}

fn validate_portfolio(config: &dyn ConfigPort) -> Result<(), LivebookError> {
    if let Some(v) = number(config, "portfolio", "initial_capital")?
        && v <= 0.0
    {
        return Err(invalid(
            "portfolio",
            "initial_capital",
            "initial_capital must be positive",
        ));
    }
    Ok(())
}

fn validate_selection(config: &dyn ConfigPort) -> Result<(), LivebookError> {
    if let Some(v) = whole(config, "selection", "max_positions")?
        && v < 1
    {
        return Err(invalid(
            "selection",
            "max_positions",
            "max_positions must be at least 1",
        ));
    }
    if let Some(v) = whole(config, "selection", "top_k")?
        && v < 1
    {
        return Err(invalid("selection", "top_k", "top_k must be at least 1"));
    }
    if let Some(v) = number(config, "selection", "min_ticket_size")?
        && v < 0.0
    {
        return Err(invalid(
            "selection",
            "min_ticket_size",
            "min_ticket_size must be non-negative",
        ));
    }
    Ok(())
}

fn validate_risk(config: &dyn ConfigPort) -> Result<(), LivebookError> {
    check_fraction(config, "risk", "stop_loss_pct")?;
    check_fraction(config, "risk", "stagnation_band")?;
    if let Some(v) = number(config, "risk", "take_profit_pct")?
        && v < 0.0
    {
        return Err(invalid(
            "risk",
            "take_profit_pct",
            "take_profit_pct must be non-negative",
        ));
    }
    if let Some(v) = number(config, "risk", "failure_threshold")?
        && !(0.0..=1.0).contains(&v)
    {
        return Err(invalid(
            "risk",
            "failure_threshold",
            "failure_threshold must be in [0, 1]",
        ));
    }
    for key in [
        "max_hold_days",
        "min_hold_days",
        "min_eval_days",
        "stagnation_days",
    ] {
        check_non_negative_int(config, "risk", key)?;
    }
    Ok(())
}

fn validate_execution(config: &dyn ConfigPort) -> Result<(), LivebookError> {
    check_fraction(config, "execution", "commission_pct")?;
    check_fraction(config, "execution", "slippage_buy_pct")?;
    check_fraction(config, "execution", "slippage_sell_pct")?;
    check_non_negative_int(config, "execution", "max_buy_deferrals")?;
    Ok(())
}
