//! Lock manager: create-if-absent mutual exclusion over resource keys
//!
//! The lock table is the only shared mutable resource besides the work item
//! partitions, and every mutation of it goes through this service. A lock is
//! acquired by atomically creating its record and released by a
//! compare-and-delete of the exact record the holder wrote, so a release can
//! never remove a lock that has since passed to someone else.

use crate::backend::StorageBackend;
use crate::layout;
use ensemble_coord_core::clock::Clock;
use ensemble_coord_core::config::RetryPolicy;
use ensemble_coord_core::lock::Lock;
use ensemble_coord_core::retry::retry_with_backoff;
use ensemble_coord_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of a release call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The caller's lock was removed
    Released,
    /// No lock exists for the key
    NotHeld,
    /// Another holder owns the key; nothing was changed
    HeldByOther { holder: String },
}

/// Service for acquiring and releasing locks
#[derive(Debug, Clone)]
pub struct LockManager {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl LockManager {
    /// Create a new lock manager
    pub fn new(backend: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>, retry: RetryPolicy) -> Self {
        Self {
            backend,
            clock,
            retry,
        }
    }

    /// Acquire `resource_key` for `holder`.
    ///
    /// Fails with [`Error::AlreadyLocked`] when someone else holds a live
    /// lock. An expired lease is broken and the create retried exactly once.
    pub async fn acquire(
        &self,
        resource_key: &str,
        holder: &str,
        lease_seconds: Option<u64>,
    ) -> Result<Lock> {
        if resource_key.is_empty() {
            return Err(Error::validation("Lock key cannot be empty"));
        }
        if holder.is_empty() {
            return Err(Error::validation("Lock holder cannot be empty"));
        }

        let key = layout::lock_key(resource_key);
        let lock = Lock::new(resource_key, holder, self.clock.now(), lease_seconds);
        let record = serde_json::to_vec(&lock)?;

        if self.backend.create_exclusive(&key, &record).await? {
            debug!(resource_key = %resource_key, holder = %holder, "Lock acquired");
            return Ok(lock);
        }

        let current_holder = match self.read_raw(resource_key).await? {
            Some((existing, raw)) if self.is_expired(&existing) => {
                if self.backend.compare_and_delete(&key, &raw).await? {
                    info!(
                        resource_key = %resource_key,
                        previous_holder = %existing.holder,
                        "Broke expired lock lease"
                    );
                }
                existing.holder
            }
            Some((existing, _)) => {
                return Err(Error::already_locked(resource_key, existing.holder));
            }
            // Released between our create and read
            None => String::from("<released>"),
        };

        if self.backend.create_exclusive(&key, &record).await? {
            debug!(resource_key = %resource_key, holder = %holder, "Lock acquired on second attempt");
            return Ok(lock);
        }

        let holder_now = self
            .get(resource_key)
            .await?
            .map(|lock| lock.holder)
            .unwrap_or(current_holder);
        Err(Error::already_locked(resource_key, holder_now))
    }

    /// Like [`acquire`](Self::acquire), but maps contention to `None`
    pub async fn try_acquire(
        &self,
        resource_key: &str,
        holder: &str,
        lease_seconds: Option<u64>,
    ) -> Result<Option<Lock>> {
        match self.acquire(resource_key, holder, lease_seconds).await {
            Ok(lock) => Ok(Some(lock)),
            Err(err) if err.is_contention() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Acquire with backoff until success or [`Error::Timeout`].
    ///
    /// `max_wait` overrides the configured wait budget; with `None` the
    /// configured retry policy applies unchanged.
    pub async fn acquire_with_retry(
        &self,
        resource_key: &str,
        holder: &str,
        lease_seconds: Option<u64>,
        max_wait: Option<Duration>,
    ) -> Result<Lock> {
        let policy = match max_wait {
            Some(wait) => RetryPolicy {
                max_attempts: u32::MAX,
                ..self.retry.clone().with_max_wait(wait)
            },
            None => self.retry.clone(),
        };
        let operation = format!("acquire lock {}", resource_key);
        retry_with_backoff(&policy, &operation, |_| {
            self.acquire(resource_key, holder, lease_seconds)
        })
        .await
    }

    /// Release `resource_key` if `holder` holds it. Idempotent.
    pub async fn release(&self, resource_key: &str, holder: &str) -> Result<ReleaseOutcome> {
        let Some((existing, raw)) = self.read_raw(resource_key).await? else {
            debug!(resource_key = %resource_key, holder = %holder, "Release of unheld lock");
            return Ok(ReleaseOutcome::NotHeld);
        };

        if !existing.is_held_by(holder) {
            warn!(
                resource_key = %resource_key,
                caller = %holder,
                holder = %existing.holder,
                "Ignoring release of a lock held by another holder"
            );
            return Ok(ReleaseOutcome::HeldByOther {
                holder: existing.holder,
            });
        }

        let key = layout::lock_key(resource_key);
        if self.backend.compare_and_delete(&key, &raw).await? {
            debug!(resource_key = %resource_key, holder = %holder, "Lock released");
            Ok(ReleaseOutcome::Released)
        } else {
            Ok(ReleaseOutcome::NotHeld)
        }
    }

    /// Remove exactly this lock record, whoever holds it.
    ///
    /// Used by recovery to drop locks of dead agents and expired leases. A
    /// lock that was replaced since `lock` was read is left alone.
    pub async fn force_release(&self, lock: &Lock) -> Result<bool> {
        let Some((current, raw)) = self.read_raw(&lock.resource_key).await? else {
            return Ok(false);
        };
        if &current != lock {
            return Ok(false);
        }
        let released = self
            .backend
            .compare_and_delete(&layout::lock_key(&lock.resource_key), &raw)
            .await?;
        if released {
            info!(
                resource_key = %lock.resource_key,
                holder = %lock.holder,
                "Force-released lock"
            );
        }
        Ok(released)
    }

    /// True when the lock has a lease and it ran out
    pub fn is_expired(&self, lock: &Lock) -> bool {
        lock.is_expired(self.clock.now())
    }

    pub async fn get(&self, resource_key: &str) -> Result<Option<Lock>> {
        Ok(self.read_raw(resource_key).await?.map(|(lock, _)| lock))
    }

    /// All lock records currently in the table
    pub async fn list(&self) -> Result<Vec<Lock>> {
        let mut locks = Vec::new();
        for key in self.backend.list(layout::LOCKS).await? {
            if !layout::is_lock_key(&key) {
                continue;
            }
            let Some(raw) = self.backend.get(&key).await? else {
                continue;
            };
            match serde_json::from_slice::<Lock>(&raw) {
                Ok(lock) => locks.push(lock),
                Err(e) => warn!("Skipping unreadable lock record {}: {}", key, e),
            }
        }
        locks.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));
        Ok(locks)
    }

    pub async fn locks_held_by(&self, holder: &str) -> Result<Vec<Lock>> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|lock| lock.is_held_by(holder))
            .collect())
    }

    /// Break every expired lease. Returns the locks that were removed.
    pub async fn sweep_expired(&self) -> Result<Vec<Lock>> {
        let mut released = Vec::new();
        for lock in self.list().await? {
            if self.is_expired(&lock) && self.force_release(&lock).await? {
                released.push(lock);
            }
        }
        Ok(released)
    }

    async fn read_raw(&self, resource_key: &str) -> Result<Option<(Lock, Vec<u8>)>> {
        let Some(raw) = self.backend.get(&layout::lock_key(resource_key)).await? else {
            return Ok(None);
        };
        let lock = serde_json::from_slice(&raw)?;
        Ok(Some((lock, raw)))
    }
}

#[cfg(test)]
mod tests {
    include!("lock_tests.rs");
}
