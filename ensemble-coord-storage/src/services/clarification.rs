//! Clarification channel: ask a human, wait a bounded time
//!
//! The request lives at `clarifications/<id>.json`. Whoever creates
//! `clarifications/<id>.answer` first decides the outcome: an operator's
//! answer, or the asker's own expiry marker once its deadline passes. Both
//! sides use `create_exclusive`, so an answer racing the timeout either wins
//! completely or is rejected.

use super::broadcast::BroadcastLog;
use crate::backend::StorageBackend;
use crate::layout;
use ensemble_coord_core::clarification::{AnswerRecord, ClarificationOutcome, ClarificationRequest};
use ensemble_coord_core::clock::Clock;
use ensemble_coord_core::config::CoordinationSettings;
use ensemble_coord_core::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Request/response channel between agents and human operators
#[derive(Debug, Clone)]
pub struct ClarificationChannel {
    backend: Arc<dyn StorageBackend>,
    clock: Arc<dyn Clock>,
    broadcast: BroadcastLog,
    settings: Arc<CoordinationSettings>,
}

impl ClarificationChannel {
    pub fn new(
        backend: Arc<dyn StorageBackend>,
        clock: Arc<dyn Clock>,
        broadcast: BroadcastLog,
        settings: Arc<CoordinationSettings>,
    ) -> Self {
        Self {
            backend,
            clock,
            broadcast,
            settings,
        }
    }

    /// Ask and wait for an answer, at most `timeout`.
    ///
    /// Never fails because nobody answered: on timeout the configured
    /// default answer is returned as [`ClarificationOutcome::TimedOut`].
    pub async fn ask(
        &self,
        requester_id: &str,
        question: &str,
        context: &str,
        timeout: Duration,
    ) -> Result<ClarificationOutcome> {
        let deadline = Instant::now() + timeout;
        let request = self.post(requester_id, question, context, timeout).await?;

        let outcome = self.wait_for_answer(&request, deadline).await;
        self.discard(&request.id).await;
        let outcome = outcome?;

        match &outcome {
            ClarificationOutcome::Answered(text) => {
                info!(request_id = %request.id, requester_id = %requester_id, "Clarification answered");
                self.broadcast
                    .record(requester_id, &format!("received answer to {}: {}", request.id, text))
                    .await;
            }
            ClarificationOutcome::TimedOut { default_answer } => {
                info!(
                    request_id = %request.id,
                    requester_id = %requester_id,
                    timeout_seconds = request.timeout_seconds,
                    "Clarification timed out, proceeding with default"
                );
                self.broadcast
                    .record(
                        requester_id,
                        &format!("no answer to {}, proceeding with: {}", request.id, default_answer),
                    )
                    .await;
            }
        }
        Ok(outcome)
    }

    async fn wait_for_answer(
        &self,
        request: &ClarificationRequest,
        deadline: Instant,
    ) -> Result<ClarificationOutcome> {
        let poll_interval = self.settings.clarification_poll_interval();
        loop {
            if let Some(AnswerRecord::Answered { text, .. }) = self.poll(&request.id).await? {
                return Ok(ClarificationOutcome::Answered(text));
            }

            let now = Instant::now();
            if now >= deadline {
                return self.expire(&request.id).await;
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// Claim the answer slot with an expiry marker. If an answer got there
    /// first, it wins.
    async fn expire(&self, request_id: &str) -> Result<ClarificationOutcome> {
        let marker = AnswerRecord::Expired {
            expired_at: self.clock.now(),
        };
        let expired = self
            .backend
            .create_exclusive(&layout::answer_key(request_id), &serde_json::to_vec(&marker)?)
            .await?;

        if !expired {
            if let Some(AnswerRecord::Answered { text, .. }) = self.poll(request_id).await? {
                return Ok(ClarificationOutcome::Answered(text));
            }
        }
        Ok(ClarificationOutcome::TimedOut {
            default_answer: self.settings.clarification_default_answer.clone(),
        })
    }

    /// Publish a request without waiting for it
    pub async fn post(
        &self,
        requester_id: &str,
        question: &str,
        context: &str,
        timeout: Duration,
    ) -> Result<ClarificationRequest> {
        let timeout_seconds = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        let request = ClarificationRequest::new(
            requester_id,
            question,
            context,
            timeout_seconds,
            self.clock.now(),
        )?;

        let created = self
            .backend
            .create_exclusive(
                &layout::clarification_key(&request.id),
                &serde_json::to_vec(&request)?,
            )
            .await?;
        if !created {
            return Err(Error::duplicate_id("Clarification", &request.id));
        }

        debug!(request_id = %request.id, requester_id = %requester_id, "Posted clarification request");
        self.broadcast
            .record(requester_id, &format!("asked {}: {}", request.id, question))
            .await;
        Ok(request)
    }

    /// Current answer slot of a request, if anything has been written
    pub async fn poll(&self, request_id: &str) -> Result<Option<AnswerRecord>> {
        match self.backend.get(&layout::answer_key(request_id)).await? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Answer an open request. Returns `false` if the request is gone,
    /// already answered or already timed out.
    pub async fn answer(&self, request_id: &str, text: &str) -> Result<bool> {
        if self
            .backend
            .get(&layout::clarification_key(request_id))
            .await?
            .is_none()
        {
            debug!(request_id = %request_id, "Answer for unknown or closed request ignored");
            return Ok(false);
        }

        let record = AnswerRecord::Answered {
            text: text.to_string(),
            answered_at: self.clock.now(),
        };
        let answer_key = layout::answer_key(request_id);
        let raw = serde_json::to_vec(&record)?;
        if !self.backend.create_exclusive(&answer_key, &raw).await? {
            debug!(request_id = %request_id, "Request already answered or expired");
            return Ok(false);
        }

        // The asker may have finished and cleaned up between our checks
        if self
            .backend
            .get(&layout::clarification_key(request_id))
            .await?
            .is_none()
        {
            self.backend.compare_and_delete(&answer_key, &raw).await?;
            return Ok(false);
        }

        info!(request_id = %request_id, "Clarification answered");
        Ok(true)
    }

    /// Close a request without an answer. Returns `false` if it was not open.
    pub async fn withdraw(&self, request_id: &str) -> Result<bool> {
        let marker = AnswerRecord::Expired {
            expired_at: self.clock.now(),
        };
        let closed = self
            .backend
            .create_exclusive(&layout::answer_key(request_id), &serde_json::to_vec(&marker)?)
            .await?;
        let existed = self
            .backend
            .delete(&layout::clarification_key(request_id))
            .await?;
        self.backend.delete(&layout::answer_key(request_id)).await?;
        Ok(closed && existed)
    }

    /// A request with its answer merged in
    pub async fn get(&self, request_id: &str) -> Result<Option<ClarificationRequest>> {
        let Some(raw) = self
            .backend
            .get(&layout::clarification_key(request_id))
            .await?
        else {
            return Ok(None);
        };
        let request: ClarificationRequest = serde_json::from_slice(&raw)?;
        let answer = self.poll(request_id).await?;
        Ok(Some(request.with_answer(answer.as_ref())))
    }

    /// Requests still waiting for an operator, oldest first
    pub async fn pending(&self) -> Result<Vec<ClarificationRequest>> {
        let mut open = Vec::new();
        for key in self.backend.list(layout::CLARIFICATIONS).await? {
            let Some(request_id) = layout::json_record_id(&key) else {
                continue;
            };
            if self.poll(request_id).await?.is_some() {
                continue;
            }
            match self.get(request_id).await {
                Ok(Some(request)) => open.push(request),
                Ok(None) => {}
                Err(Error::Serialization(e)) => {
                    warn!("Skipping unreadable clarification {}: {}", key, e)
                }
                Err(e) => return Err(e),
            }
        }
        open.sort_by(|a, b| a.asked_at.cmp(&b.asked_at).then_with(|| a.id.cmp(&b.id)));
        Ok(open)
    }

    async fn discard(&self, request_id: &str) {
        for key in [
            layout::clarification_key(request_id),
            layout::answer_key(request_id),
        ] {
            if let Err(e) = self.backend.delete(&key).await {
                warn!(request_id = %request_id, "Failed to clean up clarification: {}", e);
            }
        }
    }
}
