//! livebook: daily portfolio state-transition engine.
//!
//! Hexagonal architecture: domain logic in [`domain`], port traits in [`ports`],
//! concrete implementations in [`adapters`], invocation surface in [`cli`].

pub mod adapters;
pub mod cli;
pub mod domain;
pub mod ports;
