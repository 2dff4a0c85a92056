//! Shared fixtures for the coordination integration tests.
//!
//! Every property is checked against both backends: the in-memory map and a
//! shared directory in a temp dir.

#![allow(dead_code)]

use chrono::Utc;
use ensemble_coord_core::clock::{Clock, ManualClock};
use ensemble_coord_core::config::{CoordinationSettings, RetryPolicy};
use ensemble_coord_storage::backend::{FileSystemBackend, InMemoryBackend, StorageBackend};
use ensemble_coord_storage::Coordinator;
use std::sync::Arc;
use tempfile::TempDir;

/// One coordinator plus the clock driving it
pub struct TestContext {
    pub name: &'static str,
    pub coordinator: Coordinator,
    pub clock: ManualClock,
    _temp_dir: Option<TempDir>,
}

impl TestContext {
    pub fn in_memory() -> Self {
        let clock = ManualClock::new(Utc::now());
        let coordinator = build(Arc::new(InMemoryBackend::new()), &clock);
        Self {
            name: "memory",
            coordinator,
            clock,
            _temp_dir: None,
        }
    }

    pub async fn filesystem() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let backend = FileSystemBackend::open(temp_dir.path())
            .await
            .expect("Failed to open shared directory");
        let clock = ManualClock::new(Utc::now());
        let coordinator = build(Arc::new(backend), &clock);
        Self {
            name: "filesystem",
            coordinator,
            clock,
            _temp_dir: Some(temp_dir),
        }
    }

    /// A context per backend
    pub async fn all() -> Vec<Self> {
        vec![Self::in_memory(), Self::filesystem().await]
    }
}

pub fn test_settings() -> CoordinationSettings {
    CoordinationSettings::builder()
        .clarification_poll_interval_ms(10)
        .claim_poll_interval_ms(10)
        .lock_retry(RetryPolicy::new(100, 1, 1.5, 20).expect("valid retry policy"))
        .build()
        .expect("valid settings")
}

fn build(backend: Arc<dyn StorageBackend>, clock: &ManualClock) -> Coordinator {
    let clock: Arc<dyn Clock> = Arc::new(clock.clone());
    Coordinator::new(backend, clock, test_settings()).expect("Failed to build coordinator")
}
