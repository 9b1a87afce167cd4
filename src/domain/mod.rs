//! Core domain types and logic.

pub mod config_validation;
pub mod error;
pub mod events;
pub mod execution;
pub mod exit_rules;
pub mod market;
pub mod metrics;
pub mod portfolio;
pub mod position;
pub mod run;
pub mod signal;
