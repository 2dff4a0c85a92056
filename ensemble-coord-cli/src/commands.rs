//! Operator commands over a shared store

use crate::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Subcommand, ValueEnum};
use ensemble_coord_core::work_item::{NewWorkItem, WorkItem, WorkItemStatus};
use ensemble_coord_storage::Coordinator;
use std::io::Write;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

const FOLLOW_POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Add a work item to the pending queue
    Enqueue {
        /// Work type, used by agents to pick a handler
        #[arg(long = "type")]
        work_type: String,
        /// Lower runs first; defaults to the configured priority
        #[arg(long)]
        priority: Option<i64>,
        /// Explicit id, generated when omitted
        #[arg(long)]
        id: Option<String>,
        /// Opaque JSON payload
        #[arg(long)]
        payload: Option<String>,
        #[arg(long, default_value = "operator")]
        created_by: String,
    },
    /// List work items, all partitions when no status is given
    List {
        #[arg(value_enum)]
        status: Option<StatusArg>,
    },
    /// Print one work item as JSON
    Show { id: String },
    /// List registered agents
    Agents,
    /// List held locks
    Locks,
    /// Run a single liveness sweep
    Sweep {
        /// Identity recorded as the sweeper
        #[arg(long = "as", default_value = "operator")]
        sweeper_id: String,
    },
    /// Sweep periodically until interrupted
    Monitor {
        #[arg(long = "as", default_value = "operator")]
        sweeper_id: String,
    },
    /// List clarification requests waiting for an answer
    Questions,
    /// Answer a clarification request
    Answer { id: String, text: String },
    /// Print the broadcast log
    Log {
        /// Byte offset to resume from
        #[arg(long)]
        since: Option<u64>,
        /// Keep printing new events until interrupted
        #[arg(long)]
        follow: bool,
    },
    /// Store-wide counts
    Stats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StatusArg {
    Pending,
    Active,
    Completed,
}

impl From<StatusArg> for WorkItemStatus {
    fn from(status: StatusArg) -> Self {
        match status {
            StatusArg::Pending => WorkItemStatus::Pending,
            StatusArg::Active => WorkItemStatus::Active,
            StatusArg::Completed => WorkItemStatus::Completed,
        }
    }
}

/// Run `command`, writing human-readable output to `out`. Long-running
/// commands return once `shutdown` flips or its sender is dropped.
pub async fn execute<W: Write>(
    command: &Command,
    coordinator: &Coordinator,
    out: &mut W,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    match command {
        Command::Enqueue {
            work_type,
            priority,
            id,
            payload,
            created_by,
        } => {
            let mut new_item = NewWorkItem::new(work_type.as_str(), created_by.as_str());
            if let Some(priority) = priority {
                new_item = new_item.priority(*priority);
            }
            if let Some(id) = id {
                new_item = new_item.id(id.as_str());
            }
            if let Some(payload) = payload {
                new_item = new_item.payload(serde_json::from_str(payload)?);
            }
            let item = coordinator.work().enqueue(new_item).await?;
            writeln!(out, "{}", item.id)?;
        }
        Command::List { status } => {
            let statuses = match status {
                Some(status) => vec![WorkItemStatus::from(*status)],
                None => WorkItemStatus::ALL.to_vec(),
            };
            for status in statuses {
                for item in coordinator.work().list(status).await? {
                    writeln!(out, "{}", format_item(&item))?;
                }
            }
        }
        Command::Show { id } => {
            let item = coordinator
                .work()
                .get(id)
                .await?
                .ok_or_else(|| ensemble_coord_core::Error::not_found("WorkItem", id.as_str()))?;
            writeln!(out, "{}", serde_json::to_string_pretty(&item)?)?;
        }
        Command::Agents => {
            for agent in coordinator.registry().list().await? {
                writeln!(
                    out,
                    "{}\t{}\tlast heartbeat {}\ttask {}",
                    agent.id,
                    agent.status,
                    timestamp(&agent.last_heartbeat),
                    agent.current_task_id.as_deref().unwrap_or("-")
                )?;
            }
        }
        Command::Locks => {
            for lock in coordinator.locks().list().await? {
                let lease = match lock.lease_seconds {
                    Some(seconds) if coordinator.locks().is_expired(&lock) => {
                        format!("lease {}s (expired)", seconds)
                    }
                    Some(seconds) => format!("lease {}s", seconds),
                    None => "no lease".to_string(),
                };
                writeln!(
                    out,
                    "{}\t{}\tsince {}\t{}",
                    lock.resource_key,
                    lock.holder,
                    timestamp(&lock.acquired_at),
                    lease
                )?;
            }
        }
        Command::Sweep { sweeper_id } => {
            let report = coordinator.heartbeat_monitor(sweeper_id.as_str()).sweep().await;
            if report.is_empty() {
                writeln!(out, "nothing to recover")?;
            }
            for agent in &report.dead_agents {
                writeln!(out, "declared dead: {}", agent)?;
            }
            for item in &report.reclaimed_items {
                writeln!(out, "reclaimed: {}", item)?;
            }
            for key in report.released_locks.iter().chain(&report.expired_locks) {
                writeln!(out, "released lock: {}", key)?;
            }
            if report.failures > 0 {
                writeln!(out, "{} step(s) failed, see log", report.failures)?;
            }
        }
        Command::Monitor { sweeper_id } => {
            info!(sweeper_id = %sweeper_id, "Monitoring until interrupted");
            coordinator
                .heartbeat_monitor(sweeper_id.as_str())
                .run(shutdown)
                .await;
        }
        Command::Questions => {
            for request in coordinator.clarifications().pending().await? {
                writeln!(
                    out,
                    "{}\t{}\tasked {}\t{}",
                    request.id,
                    request.requester_id,
                    timestamp(&request.asked_at),
                    request.question
                )?;
                if !request.context.is_empty() {
                    writeln!(out, "\tcontext: {}", request.context)?;
                }
            }
        }
        Command::Answer { id, text } => {
            if !coordinator.clarifications().answer(id, text).await? {
                return Err(ensemble_coord_core::Error::state_transition(format!(
                    "Clarification {} is not open (already answered, timed out or unknown)",
                    id
                ))
                .into());
            }
            writeln!(out, "answered {}", id)?;
        }
        Command::Log { since, follow } => {
            follow_log(coordinator, out, *since, *follow, shutdown).await?;
        }
        Command::Stats => {
            let stats = coordinator.stats().await?;
            writeln!(out, "pending: {}", stats.work.pending)?;
            writeln!(out, "active: {}", stats.work.active)?;
            writeln!(out, "completed: {}", stats.work.completed)?;
            writeln!(out, "agents: {} active, {} dead", stats.active_agents, stats.dead_agents)?;
            writeln!(out, "locks: {}", stats.locks)?;
            writeln!(out, "open clarifications: {}", stats.open_clarifications)?;
        }
    }
    Ok(())
}

async fn follow_log<W: Write>(
    coordinator: &Coordinator,
    out: &mut W,
    since: Option<u64>,
    follow: bool,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let mut offset = since;
    loop {
        let page = coordinator.broadcast().read(offset).await?;
        for event in &page.events {
            writeln!(out, "{}", event)?;
        }
        out.flush()?;
        offset = Some(page.next_offset);

        if !follow || *shutdown.borrow() {
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(FOLLOW_POLL_INTERVAL) => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return Ok(());
                }
            }
        }
    }
}

fn format_item(item: &WorkItem) -> String {
    let owner = match item.status {
        WorkItemStatus::Pending => "-".to_string(),
        WorkItemStatus::Active => item.claimed_by.clone().unwrap_or_default(),
        WorkItemStatus::Completed => {
            let outcome = item
                .result
                .map(|outcome| outcome.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            format!(
                "{} by {}",
                outcome,
                item.completed_by.as_deref().unwrap_or("-")
            )
        }
    };
    format!(
        "{}\t{}\t{}\tpriority {}\t{}",
        item.status, item.id, item.work_type, item.priority, owner
    )
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}
