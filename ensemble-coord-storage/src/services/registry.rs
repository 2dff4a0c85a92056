//! Agent registry: liveness records and heartbeats
//!
//! Heartbeats rewrite the agent's record in place. Death is recorded
//! separately as a create-once marker, so a heartbeat that races with a
//! sweep can overwrite the record but can never bring the agent back.

use crate::backend::StorageBackend;
use crate::layout;
use chrono::{DateTime, Utc};
use ensemble_coord_core::agent::{AgentRecord, AgentStatus};
use ensemble_coord_core::clock::Clock;
use ensemble_coord_core::config::CoordinationSettings;
use ensemble_coord_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Content of an agent's death marker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeathRecord {
    pub declared_at: DateTime<Utc>,
    pub declared_by: String,
    pub last_heartbeat: DateTime<Utc>,
}

/// Registry of agents sharing the store
#[derive(Debug, Clone)]
pub struct AgentRegistry {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    settings: Arc<CoordinationSettings>,
}

impl AgentRegistry {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        settings: Arc<CoordinationSettings>,
    ) -> Self {
        Self {
            backend,
            clock,
            settings,
        }
    }

    /// Register a new agent as active
    pub async fn register(&self, agent_id: &str) -> Result<AgentRecord> {
        let record = AgentRecord::new(agent_id, self.clock.now())?;

        if self.is_dead(agent_id).await? {
            return Err(Self::dead_agent_error(agent_id));
        }

        let created = self
            .backend
            .create_exclusive(&layout::agent_key(agent_id), &serde_json::to_vec(&record)?)
            .await?;
        if !created {
            return match self.get(agent_id).await? {
                Some(existing) if !existing.is_active() => Err(Self::dead_agent_error(agent_id)),
                _ => Err(Error::duplicate_id("Agent", agent_id)),
            };
        }

        info!(agent_id = %agent_id, "Registered agent");
        Ok(record)
    }

    /// Refresh an agent's heartbeat and current task
    pub async fn heartbeat(
        &self,
        agent_id: &str,
        current_task_id: Option<String>,
    ) -> Result<AgentRecord> {
        let Some(mut record) = self.get(agent_id).await? else {
            return Err(Error::not_found("Agent", agent_id));
        };

        record.record_heartbeat(self.clock.now(), current_task_id)?;
        self.backend
            .put(&layout::agent_key(agent_id), &serde_json::to_vec(&record)?)
            .await?;

        // A sweep may have declared us dead between the read and the write
        if self.is_dead(agent_id).await? {
            return Err(Self::dead_agent_error(agent_id));
        }

        debug!(agent_id = %agent_id, task = ?record.current_task_id, "Heartbeat recorded");
        Ok(record)
    }

    /// Agent record with the death marker applied
    pub async fn get(&self, agent_id: &str) -> Result<Option<AgentRecord>> {
        let Some(raw) = self.backend.get(&layout::agent_key(agent_id)).await? else {
            return Ok(None);
        };
        let mut record: AgentRecord = serde_json::from_slice(&raw)?;
        if record.is_active() && self.is_dead(agent_id).await? {
            record.mark_dead();
        }
        Ok(Some(record))
    }

    /// All registered agents, sorted by id
    pub async fn list(&self) -> Result<Vec<AgentRecord>> {
        let mut agents = Vec::new();
        for key in self.backend.list(layout::AGENTS).await? {
            let Some(agent_id) = layout::json_record_id(&key) else {
                continue;
            };
            match self.get(agent_id).await {
                Ok(Some(record)) => agents.push(record),
                Ok(None) => {}
                Err(Error::Serialization(e)) => warn!("Skipping unreadable agent record {}: {}", key, e),
                Err(e) => return Err(e),
            }
        }
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(agents)
    }

    /// Active agents presumed dead by this process's clock
    pub async fn stale_agents(&self) -> Result<Vec<AgentRecord>> {
        let now = self.clock.now();
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|record| self.is_stale_at(record, now))
            .collect())
    }

    pub fn is_stale(&self, record: &AgentRecord) -> bool {
        self.is_stale_at(record, self.clock.now())
    }

    pub fn is_stale_at(&self, record: &AgentRecord, now: DateTime<Utc>) -> bool {
        record.is_stale(now, self.settings.staleness_threshold())
    }

    /// Declare an agent dead. Returns `false` if it already was.
    pub async fn mark_dead(&self, agent_id: &str, declared_by: &str) -> Result<bool> {
        let Some(mut record) = self.get(agent_id).await? else {
            return Err(Error::not_found("Agent", agent_id));
        };

        let death = DeathRecord {
            declared_at: self.clock.now(),
            declared_by: declared_by.to_string(),
            last_heartbeat: record.last_heartbeat,
        };
        let created = self
            .backend
            .create_exclusive(&layout::dead_marker_key(agent_id), &serde_json::to_vec(&death)?)
            .await?;

        record.mark_dead();
        self.backend
            .put(&layout::agent_key(agent_id), &serde_json::to_vec(&record)?)
            .await?;

        if created {
            info!(agent_id = %agent_id, declared_by = %declared_by, "Agent declared dead");
        }
        Ok(created)
    }

    pub async fn is_dead(&self, agent_id: &str) -> Result<bool> {
        Ok(self
            .backend
            .get(&layout::dead_marker_key(agent_id))
            .await?
            .is_some())
    }

    fn dead_agent_error(agent_id: &str) -> Error {
        Error::state_transition(format!(
            "Agent {} was declared dead and cannot become {}",
            agent_id,
            AgentStatus::Active
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use ensemble_coord_core::clock::ManualClock;

    fn setup_registry() -> (AgentRegistry, ManualClock) {
        let clock = ManualClock::new(Utc::now());
        let registry = AgentRegistry::new(
            Arc::new(InMemoryBackend::new()),
            Arc::new(clock.clone()),
            Arc::new(CoordinationSettings::default()),
        );
        (registry, clock)
    }

    #[tokio::test]
    async fn test_register_and_heartbeat() {
        let (registry, clock) = setup_registry();

        let record = registry.register("worker-1").await.unwrap();
        assert_eq!(record.status, AgentStatus::Active);

        clock.advance_secs(10);
        let updated = registry
            .heartbeat("worker-1", Some("item-7".to_string()))
            .await
            .unwrap();
        assert_eq!(updated.last_heartbeat, record.last_heartbeat + chrono::Duration::seconds(10));
        assert_eq!(
            registry.get("worker-1").await.unwrap().unwrap().current_task_id.as_deref(),
            Some("item-7")
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration() {
        let (registry, _clock) = setup_registry();

        registry.register("worker-1").await.unwrap();
        assert!(matches!(
            registry.register("worker-1").await,
            Err(Error::DuplicateId { .. })
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_for_unknown_agent() {
        let (registry, _clock) = setup_registry();
        assert!(registry.heartbeat("ghost", None).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_dead_agent_stays_dead() {
        let (registry, _clock) = setup_registry();
        registry.register("worker-1").await.unwrap();

        assert!(registry.mark_dead("worker-1", "sweeper").await.unwrap());
        assert!(!registry.mark_dead("worker-1", "sweeper").await.unwrap());

        assert!(matches!(
            registry.heartbeat("worker-1", None).await,
            Err(Error::StateTransition { .. })
        ));
        assert!(matches!(
            registry.register("worker-1").await,
            Err(Error::StateTransition { .. })
        ));
        assert_eq!(
            registry.get("worker-1").await.unwrap().unwrap().status,
            AgentStatus::Dead
        );
    }

    #[tokio::test]
    async fn test_late_heartbeat_cannot_resurrect() {
        let (registry, _clock) = setup_registry();
        let mut stale_view = registry.register("worker-1").await.unwrap();
        registry.mark_dead("worker-1", "sweeper").await.unwrap();

        // A heartbeat that read the record before the sweep writes it back
        stale_view.record_heartbeat(Utc::now(), None).unwrap();
        registry
            .backend
            .put(&layout::agent_key("worker-1"), &serde_json::to_vec(&stale_view).unwrap())
            .await
            .unwrap();

        assert_eq!(
            registry.get("worker-1").await.unwrap().unwrap().status,
            AgentStatus::Dead
        );
    }

    #[tokio::test]
    async fn test_staleness_includes_skew_tolerance() {
        let (registry, clock) = setup_registry();
        registry.register("worker-1").await.unwrap();

        clock.advance_secs(65);
        assert!(registry.stale_agents().await.unwrap().is_empty());

        clock.advance_secs(1);
        let stale = registry.stale_agents().await.unwrap();
        assert_eq!(stale.len(), 1);
        assert!(registry.is_stale(&stale[0]));
    }

    #[tokio::test]
    async fn test_list_is_sorted() {
        let (registry, _clock) = setup_registry();
        registry.register("b").await.unwrap();
        registry.register("a").await.unwrap();

        let ids: Vec<String> = registry.list().await.unwrap().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec!["a".to_string(), "b".to_string()]);
    }
}
