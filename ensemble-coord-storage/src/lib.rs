//! Shared-store coordination services
//!
//! This crate implements the coordination protocol on top of a
//! [`backend::StorageBackend`]: locks, the work item partitions, agent
//! liveness, clarifications and the broadcast log, plus the worker runtime
//! that drives them from an agent process.

pub mod backend;
pub mod coordinator;
pub mod layout;
pub mod services;
pub mod worker;

pub use coordinator::{CoordinationStats, Coordinator};
pub use ensemble_coord_core::{Error, Result};
pub use worker::{HandlerRegistry, WorkContext, WorkHandler, WorkerAgent, WorkerSummary};

/// Re-export core types for convenience
pub use ensemble_coord_core as core;
