//! Broadcast log: the shared append-only event stream
//!
//! Coordination never depends on this log. It exists so humans and tools can
//! watch what the agents are doing; a failed append is reported to the
//! caller but recovery and claims work the same without it.

use crate::backend::StorageBackend;
use crate::layout;
use ensemble_coord_core::clock::Clock;
use ensemble_coord_core::event::BroadcastEvent;
use ensemble_coord_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, warn};

/// Events read from the log, plus where to resume
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastPage {
    pub events: Vec<BroadcastEvent>,
    /// Byte offset to pass to the next `read`
    pub next_offset: u64,
}

/// Append-only stream of observability events
#[derive(Debug, Clone)]
pub struct BroadcastLog {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
}

impl BroadcastLog {
    pub fn new(backend: Arc<dyn StorageBackend>, clock: Arc<dyn Clock>) -> Self {
        Self { backend, clock }
    }

    /// Append one event as a single atomic record
    pub async fn append(&self, agent_id: &str, message: &str) -> Result<BroadcastEvent> {
        if agent_id.is_empty() {
            return Err(Error::validation("Broadcast agent id cannot be empty"));
        }
        let event = BroadcastEvent::new(self.clock.now(), agent_id, message);
        self.backend
            .append(layout::BROADCAST_LOG, event.to_line().as_bytes())
            .await?;
        debug!(agent_id = %agent_id, "broadcast: {}", message);
        Ok(event)
    }

    /// Append, logging instead of failing. Used by services whose own
    /// operation has already succeeded.
    pub async fn record(&self, agent_id: &str, message: &str) {
        if let Err(e) = self.append(agent_id, message).await {
            warn!(agent_id = %agent_id, "Failed to append broadcast event: {}", e);
        }
    }

    /// Read complete records starting at byte offset `since` (0 when `None`).
    ///
    /// A trailing partial line is left for the next read. Malformed lines
    /// are skipped.
    pub async fn read(&self, since: Option<u64>) -> Result<BroadcastPage> {
        let offset = since.unwrap_or(0);
        let bytes = self.backend.read_from(layout::BROADCAST_LOG, offset).await?;

        let complete = match bytes.iter().rposition(|b| *b == b'\n') {
            Some(last_newline) => &bytes[..=last_newline],
            None => &bytes[..0],
        };

        let events = String::from_utf8_lossy(complete)
            .lines()
            .filter(|line| !line.is_empty())
            .filter_map(|line| match line.parse::<BroadcastEvent>() {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("Skipping malformed broadcast record: {}", e);
                    None
                }
            })
            .collect();

        Ok(BroadcastPage {
            events,
            next_offset: offset + complete.len() as u64,
        })
    }
}
