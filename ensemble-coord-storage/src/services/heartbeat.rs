//! Heartbeat monitor: the sweep that recovers work from silent agents
//!
//! Any agent may run a sweep and several may run at once. Per-agent work is
//! serialized by a short-lease `sweep:<agent>` lock. Every step is idempotent,
//! so a sweeper that dies halfway leaves nothing that the next sweep cannot
//! finish.

use super::broadcast::BroadcastLog;
use super::lock::LockManager;
use super::registry::AgentRegistry;
use super::work_store::WorkStore;
use ensemble_coord_core::agent::AgentRecord;
use ensemble_coord_core::config::CoordinationSettings;
use ensemble_coord_core::ids::validate_identifier;
use ensemble_coord_core::lock::sweep_lock_key;
use ensemble_coord_core::Result;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// What a single sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Agents this sweep declared dead
    pub dead_agents: Vec<String>,
    /// Items returned to pending
    pub reclaimed_items: Vec<String>,
    /// Resource keys of locks dropped because their holder died
    pub released_locks: Vec<String>,
    /// Resource keys of locks dropped because their lease ran out
    pub expired_locks: Vec<String>,
    /// Steps that failed and were left for the next sweep
    pub failures: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.dead_agents.is_empty()
            && self.reclaimed_items.is_empty()
            && self.released_locks.is_empty()
            && self.expired_locks.is_empty()
    }
}

/// Periodic liveness pass over the agent registry
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    sweeper_id: String,
    registry: AgentRegistry,
    work: WorkStore,
    locks: LockManager,
    broadcast: BroadcastLog,
    settings: Arc<CoordinationSettings>,
}

impl HeartbeatMonitor {
    pub fn new<S: Into<String>>(
        sweeper_id: S,
        registry: AgentRegistry,
        work: WorkStore,
        locks: LockManager,
        broadcast: BroadcastLog,
        settings: Arc<CoordinationSettings>,
    ) -> Self {
        Self {
            sweeper_id: sweeper_id.into(),
            registry,
            work,
            locks,
            broadcast,
            settings,
        }
    }

    pub fn sweeper_id(&self) -> &str {
        &self.sweeper_id
    }

    /// Run one sweep. Failures are logged and counted, never returned.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        match self.registry.stale_agents().await {
            Ok(stale) => {
                for record in stale {
                    if let Err(e) = self.retire_agent(&record, &mut report).await {
                        warn!(agent_id = %record.id, "Sweep of stale agent failed: {}", e);
                        report.failures += 1;
                    }
                }
            }
            Err(e) => {
                error!("Failed to list agents for sweep: {}", e);
                report.failures += 1;
            }
        }

        if let Err(e) = self.finish_dead_agents(&mut report).await {
            warn!("Recovery of dead agents' leftovers failed: {}", e);
            report.failures += 1;
        }

        match self.locks.sweep_expired().await {
            Ok(expired) => {
                for lock in expired {
                    self.broadcast
                        .record(
                            &self.sweeper_id,
                            &format!("broke expired lease on {} held by {}", lock.resource_key, lock.holder),
                        )
                        .await;
                    report.expired_locks.push(lock.resource_key);
                }
            }
            Err(e) => {
                warn!("Failed to sweep expired leases: {}", e);
                report.failures += 1;
            }
        }

        if report.is_empty() {
            debug!(sweeper_id = %self.sweeper_id, "Sweep found nothing to reclaim");
        } else {
            info!(
                sweeper_id = %self.sweeper_id,
                dead_agents = report.dead_agents.len(),
                reclaimed_items = report.reclaimed_items.len(),
                released_locks = report.released_locks.len(),
                expired_locks = report.expired_locks.len(),
                "Sweep completed"
            );
        }
        report
    }

    /// Declare one stale agent dead and recover its work, under its sweep lock
    async fn retire_agent(&self, record: &AgentRecord, report: &mut SweepReport) -> Result<()> {
        let lock_key = sweep_lock_key(&record.id);
        let Some(_sweep_lock) = self
            .locks
            .try_acquire(
                &lock_key,
                &self.sweeper_id,
                Some(self.settings.sweep_lock_lease_seconds),
            )
            .await?
        else {
            debug!(agent_id = %record.id, "Another sweeper is handling this agent");
            return Ok(());
        };

        let result = self.retire_agent_locked(&record.id, report).await;
        if let Err(e) = self.locks.release(&lock_key, &self.sweeper_id).await {
            warn!(agent_id = %record.id, "Failed to release sweep lock: {}", e);
        }
        result
    }

    async fn retire_agent_locked(&self, agent_id: &str, report: &mut SweepReport) -> Result<()> {
        // Re-check under the lock: the agent may have heartbeated since the listing
        let Some(current) = self.registry.get(agent_id).await? else {
            return Ok(());
        };
        if !self.registry.is_stale(&current) {
            return Ok(());
        }

        if self.registry.mark_dead(agent_id, &self.sweeper_id).await? {
            self.broadcast
                .record(
                    &self.sweeper_id,
                    &format!(
                        "declared {} dead (last heartbeat {})",
                        agent_id,
                        current.last_heartbeat.to_rfc3339()
                    ),
                )
                .await;
            report.dead_agents.push(agent_id.to_string());
        }

        self.recover_agent(agent_id, report).await
    }

    /// Put back the items and drop the locks of a dead agent
    async fn recover_agent(&self, agent_id: &str, report: &mut SweepReport) -> Result<()> {
        report
            .reclaimed_items
            .extend(self.work.reclaim_for_agent(agent_id).await?);

        for lock in self.locks.locks_held_by(agent_id).await? {
            if self.locks.force_release(&lock).await? {
                self.broadcast
                    .record(
                        &self.sweeper_id,
                        &format!("released lock {} held by dead agent {}", lock.resource_key, agent_id),
                    )
                    .await;
                report.released_locks.push(lock.resource_key);
            }
        }
        Ok(())
    }

    /// Finish recovery for agents already dead that still own locks or
    /// active items, e.g. after a sweeper died mid-recovery
    async fn finish_dead_agents(&self, report: &mut SweepReport) -> Result<()> {
        let mut owners = BTreeSet::new();
        for lock in self.locks.list().await? {
            owners.insert(lock.holder);
        }
        for item in self.work.list_active().await? {
            if let Some(claimant) = item.claimed_by {
                owners.insert(claimant);
            }
        }

        for owner in owners {
            if report.dead_agents.contains(&owner)
                || validate_identifier("Agent id", &owner).is_err()
                || !self.registry.is_dead(&owner).await?
            {
                continue;
            }
            let lock_key = sweep_lock_key(&owner);
            let Some(_sweep_lock) = self
                .locks
                .try_acquire(&lock_key, &self.sweeper_id, Some(self.settings.sweep_lock_lease_seconds))
                .await?
            else {
                continue;
            };
            info!(agent_id = %owner, "Finishing recovery of dead agent");
            let result = self.recover_agent(&owner, report).await;
            if let Err(e) = self.locks.release(&lock_key, &self.sweeper_id).await {
                warn!(agent_id = %owner, "Failed to release sweep lock: {}", e);
            }
            if let Err(e) = result {
                warn!(agent_id = %owner, "Recovery failed: {}", e);
                report.failures += 1;
            }
        }
        Ok(())
    }

    /// Sweep every `sweep_interval` until `shutdown` turns true
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.settings.sweep_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            sweeper_id = %self.sweeper_id,
            interval_seconds = self.settings.sweep_interval_seconds,
            "Heartbeat monitor started"
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(sweeper_id = %self.sweeper_id, "Heartbeat monitor stopped");
    }
}
