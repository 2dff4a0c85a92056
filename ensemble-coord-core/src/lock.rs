//! Lock records for named resources

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Exclusive claim on a resource key
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub resource_key: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
    pub lease_seconds: Option<u64>,
}

impl Lock {
    pub fn new<S1: Into<String>, S2: Into<String>>(
        resource_key: S1,
        holder: S2,
        acquired_at: DateTime<Utc>,
        lease_seconds: Option<u64>,
    ) -> Self {
        Self {
            resource_key: resource_key.into(),
            holder: holder.into(),
            acquired_at,
            lease_seconds,
        }
    }

    /// When the lease runs out, if the lock has one
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.lease_seconds.map(|lease| {
            self.acquired_at + Duration::seconds(i64::try_from(lease).unwrap_or(i64::MAX / 1_000))
        })
    }

    /// True once `now` is past `acquired_at + lease_seconds`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|expires_at| now > expires_at)
    }

    pub fn is_held_by(&self, holder: &str) -> bool {
        self.holder == holder
    }
}

/// Resource key guarding a single work item
pub fn item_lock_key(item_id: &str) -> String {
    format!("item:{}", item_id)
}

/// Resource key a sweeper holds while reclaiming a dead agent
pub fn sweep_lock_key(agent_id: &str) -> String {
    format!("sweep:{}", agent_id)
}
