//! Coordinator bundling every service over one store

use crate::backend::{FileSystemBackend, InMemoryBackend, StorageBackend};
use crate::services::{
    AgentRegistry, BroadcastLog, ClarificationChannel, HeartbeatMonitor, LockManager, WorkStats,
    WorkStore,
};
use ensemble_coord_core::clock::{Clock, SystemClock};
use ensemble_coord_core::config::CoordinationSettings;
use ensemble_coord_core::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Entry point for agents and tools: one store, one settings value, all
/// services wired together
#[derive(Debug, Clone)]
pub struct Coordinator {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    settings: Arc<CoordinationSettings>,
    locks: LockManager,
    work: WorkStore,
    registry: AgentRegistry,
    clarifications: ClarificationChannel,
    broadcast: BroadcastLog,
}

impl Coordinator {
    /// Wire the services over `backend`. Fails on invalid settings.
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        settings: CoordinationSettings,
    ) -> Result<Self> {
        settings.validate()?;
        let settings = Arc::new(settings);

        let locks = LockManager::new(backend.clone(), clock.clone(), settings.lock_retry.clone());
        let broadcast = BroadcastLog::new(backend.clone(), clock.clone());
        let work = WorkStore::new(
            backend.clone(),
            clock.clone(),
            locks.clone(),
            broadcast.clone(),
            settings.clone(),
        );
        let registry = AgentRegistry::new(backend.clone(), clock.clone(), settings.clone());
        let clarifications = ClarificationChannel::new(
            backend.clone(),
            clock.clone(),
            broadcast.clone(),
            settings.clone(),
        );

        Ok(Self {
            backend,
            clock,
            settings,
            locks,
            work,
            registry,
            clarifications,
            broadcast,
        })
    }

    /// Coordinator over a shared directory, using the system clock
    pub async fn open_dir<P: AsRef<Path>>(root: P, settings: CoordinationSettings) -> Result<Self> {
        let backend = FileSystemBackend::open(root.as_ref()).await?;
        info!("Coordinating through {}", root.as_ref().display());
        Self::new(Arc::new(backend), Arc::new(SystemClock), settings)
    }

    /// Coordinator over a private in-memory store
    pub fn in_memory(settings: CoordinationSettings) -> Result<Self> {
        Self::new(Arc::new(InMemoryBackend::new()), Arc::new(SystemClock), settings)
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn work(&self) -> &WorkStore {
        &self.work
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn clarifications(&self) -> &ClarificationChannel {
        &self.clarifications
    }

    pub fn broadcast(&self) -> &BroadcastLog {
        &self.broadcast
    }

    pub fn settings(&self) -> &CoordinationSettings {
        &self.settings
    }

    pub fn backend(&self) -> Arc<dyn StorageBackend> {
        self.backend.clone()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    /// Heartbeat monitor that sweeps on behalf of `sweeper_id`
    pub fn heartbeat_monitor<S: Into<String>>(&self, sweeper_id: S) -> HeartbeatMonitor {
        HeartbeatMonitor::new(
            sweeper_id,
            self.registry.clone(),
            self.work.clone(),
            self.locks.clone(),
            self.broadcast.clone(),
            self.settings.clone(),
        )
    }

    /// Snapshot counts across the store
    pub async fn stats(&self) -> Result<CoordinationStats> {
        let work = self.work.stats().await?;
        let agents = self.registry.list().await?;
        let active_agents = agents.iter().filter(|agent| agent.is_active()).count();

        Ok(CoordinationStats {
            work,
            active_agents,
            dead_agents: agents.len() - active_agents,
            locks: self.locks.list().await?.len(),
            open_clarifications: self.clarifications.pending().await?.len(),
        })
    }
}

/// Store-wide counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoordinationStats {
    pub work: WorkStats,
    pub active_agents: usize,
    pub dead_agents: usize,
    pub locks: usize,
    pub open_clarifications: usize,
}
