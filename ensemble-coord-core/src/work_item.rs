//! Work item domain model and lifecycle
//!
//! A work item is the schedulable unit: an opaque typed payload plus the
//! lifecycle metadata the coordination layer manages. Items move between
//! three partitions and are never deleted:
//!
//! ```text
//! pending ──claim──▶ active ──complete──▶ completed (terminal)
//!    ▲                 │
//!    └────reclaim──────┘
//! ```
//!
//! # Examples
//!
//! ```rust
//! use ensemble_coord_core::work_item::*;
//! use serde_json::json;
//!
//! let item = NewWorkItem::new("code-review", "planner")
//!     .priority(1)
//!     .payload(json!({"path": "src/lib.rs"}))
//!     .into_work_item(5, chrono::Utc::now())
//!     .unwrap();
//!
//! assert_eq!(item.status, WorkItemStatus::Pending);
//! assert!(item.claimed_by.is_none());
//! ```

use crate::ids::{generate_id, validate_identifier};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state, which is also the partition the item lives in
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum WorkItemStatus {
    Pending,
    Active,
    Completed,
}

/// Final result of a completed item
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkOutcome {
    Success,
    Failed,
}

/// A unit of work shared between agents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    pub id: String,
    /// Open-ended type tag, never interpreted by the coordination layer
    #[serde(rename = "type")]
    pub work_type: String,
    pub priority: i64,
    pub payload: serde_json::Value,
    pub status: WorkItemStatus,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_by: Option<String>,
    pub result: Option<WorkOutcome>,
}

impl WorkItemStatus {
    pub const ALL: [WorkItemStatus; 3] = [
        WorkItemStatus::Pending,
        WorkItemStatus::Active,
        WorkItemStatus::Completed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkItemStatus::Pending => "pending",
            WorkItemStatus::Active => "active",
            WorkItemStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkItemStatus::Completed)
    }
}

impl fmt::Display for WorkItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkItemStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(WorkItemStatus::Pending),
            "active" => Ok(WorkItemStatus::Active),
            "completed" => Ok(WorkItemStatus::Completed),
            other => Err(Error::validation(format!(
                "Unknown work item status '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for WorkOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkOutcome::Success => f.write_str("success"),
            WorkOutcome::Failed => f.write_str("failed"),
        }
    }
}

impl WorkItem {
    /// Stamp the item as claimed by `agent_id`
    pub fn mark_claimed(&mut self, agent_id: &str, at: DateTime<Utc>) -> Result<()> {
        if self.status != WorkItemStatus::Pending {
            return Err(Error::state_transition(format!(
                "Work item {} cannot be claimed from status {}",
                self.id, self.status
            )));
        }
        self.status = WorkItemStatus::Active;
        self.claimed_by = Some(agent_id.to_string());
        self.claimed_at = Some(at);
        Ok(())
    }

    /// Stamp the item as completed; only the claimant may do this
    pub fn mark_completed(
        &mut self,
        agent_id: &str,
        outcome: WorkOutcome,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if self.status != WorkItemStatus::Active {
            return Err(Error::state_transition(format!(
                "Work item {} cannot be completed from status {}",
                self.id, self.status
            )));
        }
        self.ensure_claimed_by(agent_id)?;
        self.status = WorkItemStatus::Completed;
        self.completed_by = self.claimed_by.take();
        self.completed_at = Some(at);
        self.result = Some(outcome);
        Ok(())
    }

    /// Return the item to pending and forget its claimant
    pub fn mark_reclaimed(&mut self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::state_transition(format!(
                "Work item {} is completed and cannot be reclaimed",
                self.id
            )));
        }
        self.status = WorkItemStatus::Pending;
        self.claimed_by = None;
        self.claimed_at = None;
        Ok(())
    }

    /// Fail loudly when `agent_id` is not the current claimant
    pub fn ensure_claimed_by(&self, agent_id: &str) -> Result<()> {
        match self.claimed_by.as_deref() {
            Some(owner) if owner == agent_id => Ok(()),
            Some(owner) => Err(Error::not_owner(
                format!("work item {}", self.id),
                agent_id,
                owner,
            )),
            None => Err(Error::not_owner(
                format!("work item {}", self.id),
                agent_id,
                "<unclaimed>",
            )),
        }
    }

    /// `claimed_by` is set exactly when the item is active
    pub fn is_consistent(&self) -> bool {
        (self.status == WorkItemStatus::Active) == self.claimed_by.is_some()
    }

    /// Claim order: ascending priority, then FIFO, then id for determinism
    pub fn claim_order_key(&self) -> (i64, DateTime<Utc>, &str) {
        (self.priority, self.created_at, self.id.as_str())
    }

    pub fn matches_type(&self, type_filter: Option<&str>) -> bool {
        type_filter.map_or(true, |wanted| self.work_type == wanted)
    }
}

/// Producer-side description of an item to enqueue
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewWorkItem {
    pub id: Option<String>,
    pub work_type: String,
    pub priority: Option<i64>,
    pub payload: serde_json::Value,
    pub created_by: String,
}

impl NewWorkItem {
    pub fn new<S1: Into<String>, S2: Into<String>>(work_type: S1, created_by: S2) -> Self {
        Self {
            id: None,
            work_type: work_type.into(),
            priority: None,
            payload: serde_json::Value::Null,
            created_by: created_by.into(),
        }
    }

    pub fn id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Validate and materialize a pending item
    pub fn into_work_item(self, default_priority: i64, now: DateTime<Utc>) -> Result<WorkItem> {
        let id = self.id.unwrap_or_else(generate_id);
        validate_identifier("Work item id", &id)?;
        validate_identifier("Creator id", &self.created_by)?;
        if self.work_type.trim().is_empty() {
            return Err(Error::validation("Work item type cannot be empty"));
        }
        if self.work_type.len() > 100 {
            return Err(Error::validation(
                "Work item type cannot exceed 100 characters",
            ));
        }

        Ok(WorkItem {
            id,
            work_type: self.work_type,
            priority: self.priority.unwrap_or(default_priority),
            payload: self.payload,
            status: WorkItemStatus::Pending,
            created_at: now,
            created_by: self.created_by,
            claimed_by: None,
            claimed_at: None,
            completed_at: None,
            completed_by: None,
            result: None,
        })
    }
}
