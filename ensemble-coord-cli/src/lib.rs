//! Operator command line for Ensemble Coordination
//!
//! Inspect and administer a shared coordination store: enqueue work, look at
//! the partitions, agents and locks, run liveness sweeps, answer
//! clarification requests and read the broadcast log.

pub mod commands;
pub mod config;
pub mod error;
pub mod logging;

#[cfg(test)]
mod config_tests;

pub use error::{Error, Result};

/// Re-export the coordination crates for convenience
pub use ensemble_coord_core as core;
pub use ensemble_coord_storage as storage;
