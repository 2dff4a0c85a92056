//! Clarification requests: bounded waits for human input
//!
//! A clarification is a poll-plus-timeout exchange, never a true blocking
//! wait. When no answer arrives in time the asking agent proceeds with a
//! documented default, so a missing human can never deadlock the system.

use crate::ids::{generate_id, validate_identifier};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A question posted by an agent for a human operator
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClarificationRequest {
    pub id: String,
    pub requester_id: String,
    pub question: String,
    pub context: String,
    pub asked_at: DateTime<Utc>,
    pub answered: bool,
    pub answer: Option<String>,
    pub timeout_seconds: u64,
}

/// What a posted request resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClarificationOutcome {
    /// A human answered in time
    Answered(String),
    /// Nobody answered; the caller proceeds with the default
    TimedOut { default_answer: String },
}

/// Stored answer, also used as the timeout marker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum AnswerRecord {
    Answered {
        text: String,
        answered_at: DateTime<Utc>,
    },
    Expired {
        expired_at: DateTime<Utc>,
    },
}

impl ClarificationRequest {
    pub fn new(
        requester_id: &str,
        question: &str,
        context: &str,
        timeout_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        validate_identifier("Requester id", requester_id)?;
        if question.trim().is_empty() {
            return Err(Error::validation("Clarification question cannot be empty"));
        }
        Ok(Self {
            id: generate_id(),
            requester_id: requester_id.to_string(),
            question: question.to_string(),
            context: context.to_string(),
            asked_at: now,
            answered: false,
            answer: None,
            timeout_seconds,
        })
    }

    /// Deadline by the asker's clock, for display only
    pub fn deadline(&self) -> DateTime<Utc> {
        self.asked_at
            + chrono::Duration::seconds(
                i64::try_from(self.timeout_seconds).unwrap_or(i64::MAX / 1_000),
            )
    }

    /// Merge a stored answer into the request view
    pub fn with_answer(mut self, answer: Option<&AnswerRecord>) -> Self {
        if let Some(AnswerRecord::Answered { text, .. }) = answer {
            self.answered = true;
            self.answer = Some(text.clone());
        }
        self
    }
}

impl ClarificationOutcome {
    /// The text the caller should act on
    pub fn text(&self) -> &str {
        match self {
            ClarificationOutcome::Answered(text) => text,
            ClarificationOutcome::TimedOut { default_answer } => default_answer,
        }
    }

    pub fn is_answered(&self) -> bool {
        matches!(self, ClarificationOutcome::Answered(_))
    }
}
