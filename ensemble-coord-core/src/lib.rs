//! Core domain models and primitives for Ensemble Coordination
//!
//! This crate contains the records shared between cooperating agents (work
//! items, locks, agent liveness, clarification requests, broadcast events),
//! the settings that bound the protocol, and the retry combinator agents use
//! instead of inline sleep loops. It performs no I/O of its own.

pub mod agent;
pub mod clarification;
pub mod clock;
pub mod config;
pub mod error;
pub mod event;
pub mod ids;
pub mod lock;
pub mod retry;
pub mod work_item;

pub use error::{Error, Result};
