//! Agent liveness records
//!
//! An agent is an independent worker session. Its record is created on
//! registration, refreshed by heartbeats and transitioned to dead only by a
//! sweep. A dead id never returns to active.

use crate::ids::validate_identifier;
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Liveness state of an agent
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Dead,
}

/// Registry entry for a single agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub current_task_id: Option<String>,
    pub status: AgentStatus,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AgentStatus::Active => f.write_str("active"),
            AgentStatus::Dead => f.write_str("dead"),
        }
    }
}

impl AgentRecord {
    /// Create a new active agent record
    pub fn new(id: &str, now: DateTime<Utc>) -> Result<Self> {
        validate_identifier("Agent id", id)?;
        Ok(Self {
            id: id.to_string(),
            started_at: now,
            last_heartbeat: now,
            current_task_id: None,
            status: AgentStatus::Active,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == AgentStatus::Active
    }

    /// Record a heartbeat. The timestamp never moves backwards.
    pub fn record_heartbeat(
        &mut self,
        now: DateTime<Utc>,
        current_task_id: Option<String>,
    ) -> Result<()> {
        if !self.is_active() {
            return Err(Error::state_transition(format!(
                "Agent {} was declared dead and cannot heartbeat",
                self.id
            )));
        }
        if now > self.last_heartbeat {
            self.last_heartbeat = now;
        }
        self.current_task_id = current_task_id;
        Ok(())
    }

    /// One-way transition to dead
    pub fn mark_dead(&mut self) {
        self.status = AgentStatus::Dead;
        self.current_task_id = None;
    }

    /// Seconds since the last heartbeat, clamped at zero
    pub fn silence(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_heartbeat).max(Duration::zero())
    }

    /// An active agent silent for longer than `threshold` is presumed dead
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.is_active() && self.silence(now) > threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_agent_is_active() {
        let record = AgentRecord::new("worker-1", Utc::now()).unwrap();
        assert!(record.is_active());
        assert_eq!(record.started_at, record.last_heartbeat);
        assert!(AgentRecord::new("bad id", Utc::now()).is_err());
    }

    #[test]
    fn test_heartbeat_is_monotonic() {
        let start = Utc::now();
        let mut record = AgentRecord::new("worker-1", start).unwrap();

        record
            .record_heartbeat(start + Duration::seconds(10), Some("task-9".to_string()))
            .unwrap();
        record
            .record_heartbeat(start + Duration::seconds(5), None)
            .unwrap();

        assert_eq!(record.last_heartbeat, start + Duration::seconds(10));
        assert!(record.current_task_id.is_none());
    }

    #[test]
    fn test_dead_agent_cannot_heartbeat() {
        let mut record = AgentRecord::new("worker-1", Utc::now()).unwrap();
        record.mark_dead();

        let err = record.record_heartbeat(Utc::now(), None).unwrap_err();
        assert!(matches!(err, Error::StateTransition { .. }));
        assert_eq!(record.status, AgentStatus::Dead);
    }

    #[test]
    fn test_staleness() {
        let start = Utc::now();
        let record = AgentRecord::new("worker-1", start).unwrap();
        let threshold = Duration::seconds(60);

        assert!(!record.is_stale(start + Duration::seconds(60), threshold));
        assert!(record.is_stale(start + Duration::seconds(61), threshold));

        let mut dead = record.clone();
        dead.mark_dead();
        assert!(!dead.is_stale(start + Duration::seconds(600), threshold));
    }
}
