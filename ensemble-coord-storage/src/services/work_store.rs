//! Work store: the pending/active/completed partitions
//!
//! An item lives in exactly one partition. Transitions between partitions
//! are single `move_atomic` calls made while holding the item's lock
//! (`item:<id>`), so the lock table decides who may move an item and the
//! partitions record where it is.
//!
//! Each transition writes the stamped record where nobody else can write it
//! concurrently and then moves it:
//!
//! - claim stamps the record in `pending/` (the claimer holds the item lock)
//!   and moves it to `active/`.
//! - complete moves the record to `completed/` and then stamps it there.
//! - reclaim takes the item lock over from the dead claimant, moves the
//!   record to `pending/` and clears the claimant there.
//!
//! A process that dies between the move and the stamp leaves a record whose
//! status disagrees with its partition. [`WorkStore::reclaim_for_agent`]
//! repairs those for the dead agent, and `claim` repairs a stale claimant
//! stamp left in `pending/` once it owns the item lock.

use super::broadcast::BroadcastLog;
use super::lock::LockManager;
use crate::backend::StorageBackend;
use crate::layout;
use ensemble_coord_core::clock::Clock;
use ensemble_coord_core::config::CoordinationSettings;
use ensemble_coord_core::ids::generate_id;
use ensemble_coord_core::lock::{item_lock_key, Lock};
use ensemble_coord_core::work_item::{NewWorkItem, WorkItem, WorkItemStatus, WorkOutcome};
use ensemble_coord_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Item counts per partition
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkStats {
    pub pending: usize,
    pub active: usize,
    pub completed: usize,
}

impl WorkStats {
    pub fn total(&self) -> usize {
        self.pending + self.active + self.completed
    }
}

/// Service owning every work item mutation
#[derive(Debug, Clone)]
pub struct WorkStore {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    locks: LockManager,
    broadcast: BroadcastLog,
    settings: Arc<CoordinationSettings>,
}

impl WorkStore {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        locks: LockManager,
        broadcast: BroadcastLog,
        settings: Arc<CoordinationSettings>,
    ) -> Self {
        Self {
            backend,
            clock,
            locks,
            broadcast,
            settings,
        }
    }

    /// Add a new item to the pending partition
    pub async fn enqueue(&self, new_item: NewWorkItem) -> Result<WorkItem> {
        let item = new_item.into_work_item(self.settings.default_priority, self.clock.now())?;

        if let Some(limit) = self.settings.max_pending_items {
            let pending = self.backend.list(layout::partition(WorkItemStatus::Pending)).await?.len();
            if pending >= limit {
                warn!(pending = pending, limit = limit, "Rejecting enqueue, queue is full");
                return Err(Error::QueueFull { pending, limit });
            }
        }

        let reservation = layout::id_reservation_key(&item.id);
        if !self
            .backend
            .create_exclusive(&reservation, item.created_by.as_bytes())
            .await?
        {
            return Err(Error::duplicate_id("Work item", &item.id));
        }

        let record = serde_json::to_vec(&item)?;
        if let Err(e) = self
            .backend
            .put(&layout::item_key(WorkItemStatus::Pending, &item.id), &record)
            .await
        {
            if let Err(cleanup) = self.backend.delete(&reservation).await {
                warn!(item_id = %item.id, "Failed to drop id reservation: {}", cleanup);
            }
            return Err(e);
        }

        info!(
            item_id = %item.id,
            work_type = %item.work_type,
            priority = item.priority,
            created_by = %item.created_by,
            "Enqueued work item"
        );
        self.broadcast
            .record(
                &item.created_by,
                &format!("enqueued {} ({}, priority {})", item.id, item.work_type, item.priority),
            )
            .await;
        Ok(item)
    }

    /// Claim the most urgent pending item, optionally of one type.
    ///
    /// `Ok(None)` means nothing was claimable. Losing the race for a
    /// candidate moves on to the next one instead of retrying it.
    pub async fn claim(&self, agent_id: &str, type_filter: Option<&str>) -> Result<Option<WorkItem>> {
        self.claim_where(agent_id, |item| item.matches_type(type_filter))
            .await
    }

    /// [`claim`](Self::claim) with an arbitrary candidate filter
    pub async fn claim_where<F>(&self, agent_id: &str, filter: F) -> Result<Option<WorkItem>>
    where
        F: Fn(&WorkItem) -> bool,
    {
        let mut candidates: Vec<WorkItem> = self
            .list(WorkItemStatus::Pending)
            .await?
            .into_iter()
            .filter(|item| filter(item))
            .collect();
        candidates.sort_by(|a, b| a.claim_order_key().cmp(&b.claim_order_key()));

        for candidate in candidates {
            let lock_key = item_lock_key(&candidate.id);
            let Some(_lock) = self
                .locks
                .try_acquire(&lock_key, agent_id, self.settings.default_lease_seconds)
                .await?
            else {
                debug!(item_id = %candidate.id, agent_id = %agent_id, "Lost race for work item");
                continue;
            };

            match self.claim_locked(&candidate.id, agent_id).await {
                Ok(Some(item)) => {
                    info!(item_id = %item.id, agent_id = %agent_id, "Claimed work item");
                    self.broadcast
                        .record(agent_id, &format!("claimed {} ({})", item.id, item.work_type))
                        .await;
                    return Ok(Some(item));
                }
                Ok(None) => {
                    self.locks.release(&lock_key, agent_id).await?;
                }
                Err(e) => {
                    if let Err(release_err) = self.locks.release(&lock_key, agent_id).await {
                        warn!(item_id = %candidate.id, "Failed to release item lock: {}", release_err);
                    }
                    return Err(e);
                }
            }
        }

        Ok(None)
    }

    /// Second half of a claim, run while holding the item lock
    async fn claim_locked(&self, item_id: &str, agent_id: &str) -> Result<Option<WorkItem>> {
        let pending_key = layout::item_key(WorkItemStatus::Pending, item_id);
        let Some(mut item) = self.read_item(&pending_key).await? else {
            // Claimed and moved by someone who held the lock before us
            return Ok(None);
        };

        if item.status != WorkItemStatus::Pending {
            warn!(
                item_id = %item_id,
                stale_claimant = ?item.claimed_by,
                "Repairing interrupted claim"
            );
            item.mark_reclaimed()?;
        }

        item.mark_claimed(agent_id, self.clock.now())?;
        self.backend.put(&pending_key, &serde_json::to_vec(&item)?).await?;

        let active_key = layout::item_key(WorkItemStatus::Active, item_id);
        if self.backend.move_atomic(&pending_key, &active_key).await? {
            Ok(Some(item))
        } else {
            Ok(None)
        }
    }

    /// Finish an item. Only its current claimant may do this.
    pub async fn complete(
        &self,
        agent_id: &str,
        item_id: &str,
        outcome: WorkOutcome,
    ) -> Result<WorkItem> {
        let active_key = layout::item_key(WorkItemStatus::Active, item_id);
        let Some(mut item) = self.read_item(&active_key).await? else {
            return Err(self.not_active_error(agent_id, item_id).await?);
        };

        item.ensure_claimed_by(agent_id)?;
        let lock_key = item_lock_key(item_id);
        match self.locks.get(&lock_key).await? {
            Some(lock) if lock.is_held_by(agent_id) => {}
            other => {
                let owner = other.map(|lock| lock.holder).unwrap_or_else(|| "<unlocked>".to_string());
                return Err(Error::not_owner(format!("work item {}", item_id), agent_id, owner));
            }
        }

        item.mark_completed(agent_id, outcome, self.clock.now())?;

        let completed_key = layout::item_key(WorkItemStatus::Completed, item_id);
        if !self.backend.move_atomic(&active_key, &completed_key).await? {
            return Err(Error::not_owner(
                format!("work item {}", item_id),
                agent_id,
                "<reclaimed>",
            ));
        }
        self.backend
            .put(&completed_key, &serde_json::to_vec(&item)?)
            .await?;
        self.locks.release(&lock_key, agent_id).await?;

        info!(item_id = %item_id, agent_id = %agent_id, outcome = %outcome, "Completed work item");
        self.broadcast
            .record(agent_id, &format!("completed {} ({})", item_id, outcome))
            .await;
        Ok(item)
    }

    async fn not_active_error(&self, agent_id: &str, item_id: &str) -> Result<Error> {
        if self.read_status(WorkItemStatus::Completed, item_id).await? {
            return Ok(Error::state_transition(format!(
                "Work item {} is already completed",
                item_id
            )));
        }
        if self.read_status(WorkItemStatus::Pending, item_id).await? {
            return Ok(Error::not_owner(
                format!("work item {}", item_id),
                agent_id,
                "<unclaimed>",
            ));
        }
        Ok(Error::not_found("Work item", item_id))
    }

    /// Return an active item to pending and drop its claimant's lock.
    ///
    /// Returns `false` when the item is not active or another recovery pass
    /// got to it first.
    pub async fn reclaim(&self, item_id: &str) -> Result<bool> {
        let active_key = layout::item_key(WorkItemStatus::Active, item_id);
        let Some(item) = self.read_item(&active_key).await? else {
            return Ok(false);
        };
        let claimant = item.claimed_by.clone().unwrap_or_default();

        let Some(recovery_lock) = self.take_over_item_lock(item_id, &claimant).await? else {
            return Ok(false);
        };

        let result = self.reclaim_locked(item_id, &claimant).await;
        self.release_recovery_lock(&recovery_lock).await;
        let reclaimed = result?;

        if reclaimed {
            info!(item_id = %item_id, previous_claimant = %claimant, "Reclaimed work item");
            self.broadcast
                .record(
                    &recovery_lock.holder,
                    &format!("reclaimed {} from {}", item_id, claimant),
                )
                .await;
        }
        Ok(reclaimed)
    }

    async fn reclaim_locked(&self, item_id: &str, claimant: &str) -> Result<bool> {
        let active_key = layout::item_key(WorkItemStatus::Active, item_id);
        let Some(mut item) = self.read_item(&active_key).await? else {
            return Ok(false);
        };
        if item.claimed_by.as_deref().unwrap_or_default() != claimant {
            return Ok(false);
        }

        let pending_key = layout::item_key(WorkItemStatus::Pending, item_id);
        if !self.backend.move_atomic(&active_key, &pending_key).await? {
            return Ok(false);
        }
        item.mark_reclaimed()?;
        self.backend.put(&pending_key, &serde_json::to_vec(&item)?).await?;
        Ok(true)
    }

    /// Recover everything `agent_id` left behind. Returns the ids of items
    /// that went back to pending.
    pub async fn reclaim_for_agent(&self, agent_id: &str) -> Result<Vec<String>> {
        let mut reclaimed = Vec::new();

        for item in self.list(WorkItemStatus::Active).await? {
            if item.claimed_by.as_deref() == Some(agent_id) && self.reclaim(&item.id).await? {
                reclaimed.push(item.id);
            }
        }

        for item in self.list(WorkItemStatus::Pending).await? {
            if item.claimed_by.as_deref() == Some(agent_id) {
                self.repair_pending(&item.id, agent_id).await?;
            }
        }

        for item in self.list(WorkItemStatus::Completed).await? {
            if item.status != WorkItemStatus::Completed && item.claimed_by.as_deref() == Some(agent_id) {
                self.repair_completed(item).await?;
            }
        }

        Ok(reclaimed)
    }

    /// Clear a claimant stamp left in `pending/` by an interrupted claim
    async fn repair_pending(&self, item_id: &str, agent_id: &str) -> Result<()> {
        let Some(recovery_lock) = self.take_over_item_lock(item_id, agent_id).await? else {
            return Ok(());
        };

        let pending_key = layout::item_key(WorkItemStatus::Pending, item_id);
        let result = async {
            if let Some(mut item) = self.read_item(&pending_key).await? {
                if item.claimed_by.as_deref() == Some(agent_id) {
                    item.mark_reclaimed()?;
                    self.backend.put(&pending_key, &serde_json::to_vec(&item)?).await?;
                    info!(item_id = %item_id, agent_id = %agent_id, "Repaired interrupted claim");
                }
            }
            Ok::<(), Error>(())
        }
        .await;
        self.release_recovery_lock(&recovery_lock).await;
        result
    }

    /// Stamp a record whose completion was interrupted after the move.
    /// The outcome is unknown, so `result` stays empty.
    async fn repair_completed(&self, mut item: WorkItem) -> Result<()> {
        item.status = WorkItemStatus::Completed;
        item.completed_by = item.claimed_by.take();
        item.completed_at = Some(self.clock.now());
        self.backend
            .put(
                &layout::item_key(WorkItemStatus::Completed, &item.id),
                &serde_json::to_vec(&item)?,
            )
            .await?;

        let claimant = item.completed_by.clone().unwrap_or_default();
        self.locks.release(&item_lock_key(&item.id), &claimant).await?;
        info!(item_id = %item.id, agent_id = %claimant, "Repaired interrupted completion");
        Ok(())
    }

    /// Drop `claimant`'s item lock (or an expired one) and acquire it for a
    /// recovery pass. `None` when someone else is already recovering.
    async fn take_over_item_lock(&self, item_id: &str, claimant: &str) -> Result<Option<Lock>> {
        let lock_key = item_lock_key(item_id);
        if let Some(existing) = self.locks.get(&lock_key).await? {
            if existing.is_held_by(claimant) || self.locks.is_expired(&existing) {
                self.locks.force_release(&existing).await?;
            } else {
                debug!(
                    item_id = %item_id,
                    holder = %existing.holder,
                    "Item lock held by another recovery pass"
                );
                return Ok(None);
            }
        }

        let holder = format!("recovery-{}", generate_id());
        self.locks
            .try_acquire(&lock_key, &holder, Some(self.settings.sweep_lock_lease_seconds))
            .await
    }

    async fn release_recovery_lock(&self, lock: &Lock) {
        if let Err(e) = self.locks.release(&lock.resource_key, &lock.holder).await {
            warn!(resource_key = %lock.resource_key, "Failed to release recovery lock: {}", e);
        }
    }

    /// Look an item up in whichever partition holds it
    pub async fn get(&self, item_id: &str) -> Result<Option<WorkItem>> {
        // Two passes: an item moving between partitions can slip past one.
        for _ in 0..2 {
            for status in WorkItemStatus::ALL {
                if let Some(item) = self.read_item(&layout::item_key(status, item_id)).await? {
                    return Ok(Some(item));
                }
            }
        }
        Ok(None)
    }

    /// Items in one partition, in claim order
    pub async fn list(&self, status: WorkItemStatus) -> Result<Vec<WorkItem>> {
        let mut items = Vec::new();
        for key in self.backend.list(layout::partition(status)).await? {
            if layout::json_record_id(&key).is_none() {
                continue;
            }
            match self.read_item(&key).await {
                Ok(Some(item)) => items.push(item),
                Ok(None) => {}
                Err(Error::Serialization(e)) => warn!("Skipping unreadable work item {}: {}", key, e),
                Err(e) => return Err(e),
            }
        }
        items.sort_by(|a, b| a.claim_order_key().cmp(&b.claim_order_key()));
        Ok(items)
    }

    pub async fn list_pending(&self) -> Result<Vec<WorkItem>> {
        self.list(WorkItemStatus::Pending).await
    }

    pub async fn list_active(&self) -> Result<Vec<WorkItem>> {
        self.list(WorkItemStatus::Active).await
    }

    pub async fn list_completed(&self) -> Result<Vec<WorkItem>> {
        self.list(WorkItemStatus::Completed).await
    }

    pub async fn stats(&self) -> Result<WorkStats> {
        let mut stats = WorkStats::default();
        for status in WorkItemStatus::ALL {
            let count = self
                .backend
                .list(layout::partition(status))
                .await?
                .iter()
                .filter(|key| layout::json_record_id(key).is_some())
                .count();
            match status {
                WorkItemStatus::Pending => stats.pending = count,
                WorkItemStatus::Active => stats.active = count,
                WorkItemStatus::Completed => stats.completed = count,
            }
        }
        Ok(stats)
    }

    async fn read_item(&self, key: &str) -> Result<Option<WorkItem>> {
        match self.backend.get(key).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    async fn read_status(&self, status: WorkItemStatus, item_id: &str) -> Result<bool> {
        Ok(self
            .backend
            .get(&layout::item_key(status, item_id))
            .await?
            .is_some())
    }
}
