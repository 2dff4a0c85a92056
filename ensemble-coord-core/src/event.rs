//! Broadcast log events
//!
//! Each event is one line: `[timestamp] [agentId] message`. Newlines inside
//! a message are escaped so a record can never span lines.

use crate::{Error, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Immutable observability event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEvent {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub message: String,
}

impl BroadcastEvent {
    pub fn new<S1: Into<String>, S2: Into<String>>(
        timestamp: DateTime<Utc>,
        agent_id: S1,
        message: S2,
    ) -> Self {
        Self {
            timestamp,
            agent_id: agent_id.into(),
            message: message.into(),
        }
    }

    /// Serialized record including the trailing newline
    pub fn to_line(&self) -> String {
        format!("{}\n", self)
    }
}

impl fmt::Display for BroadcastEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] [{}] {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            sanitize_agent_id(&self.agent_id),
            escape_message(&self.message)
        )
    }
}

impl FromStr for BroadcastEvent {
    type Err = Error;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim_end_matches(['\n', '\r']);
        let malformed = || Error::validation(format!("Malformed broadcast record: {}", line));

        let rest = line.strip_prefix('[').ok_or_else(malformed)?;
        let (timestamp, rest) = rest.split_once("] [").ok_or_else(malformed)?;
        let (agent_id, message) = rest.split_once(']').ok_or_else(malformed)?;
        let message = message.strip_prefix(' ').unwrap_or(message);

        let timestamp = DateTime::parse_from_rfc3339(timestamp)
            .map_err(|_| malformed())?
            .with_timezone(&Utc);

        Ok(Self {
            timestamp,
            agent_id: agent_id.to_string(),
            message: unescape_message(message),
        })
    }
}

fn sanitize_agent_id(agent_id: &str) -> String {
    agent_id
        .chars()
        .map(|c| if c == '[' || c == ']' || c.is_control() { '_' } else { c })
        .collect()
}

fn escape_message(message: &str) -> String {
    let mut escaped = String::with_capacity(message.len());
    for c in message.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            other => escaped.push(other),
        }
    }
    escaped
}

fn unescape_message(message: &str) -> String {
    let mut unescaped = String::with_capacity(message.len());
    let mut chars = message.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            unescaped.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => unescaped.push('\n'),
            Some('r') => unescaped.push('\r'),
            Some('\\') => unescaped.push('\\'),
            Some(other) => {
                unescaped.push('\\');
                unescaped.push(other);
            }
            None => unescaped.push('\\'),
        }
    }
    unescaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_format() {
        let timestamp = DateTime::parse_from_rfc3339("2026-10-16T09:30:00.250Z")
            .unwrap()
            .with_timezone(&Utc);
        let event = BroadcastEvent::new(timestamp, "worker-1", "claimed item 42");

        assert_eq!(
            event.to_string(),
            "[2026-10-16T09:30:00.250Z] [worker-1] claimed item 42"
        );
    }

    #[test]
    fn test_multiline_message_stays_on_one_line() {
        let event = BroadcastEvent::new(Utc::now(), "worker-1", "first\nsecond\\path");
        let line = event.to_line();

        assert_eq!(line.matches('\n').count(), 1);
        let parsed: BroadcastEvent = line.parse().unwrap();
        assert_eq!(parsed.message, "first\nsecond\\path");
        assert_eq!(parsed.agent_id, "worker-1");
    }

    #[test]
    fn test_message_with_brackets_parses() {
        let line = "[2026-10-16T09:30:00.000Z] [sweeper] reclaimed [item-7] from agent-3";
        let parsed: BroadcastEvent = line.parse().unwrap();
        assert_eq!(parsed.agent_id, "sweeper");
        assert_eq!(parsed.message, "reclaimed [item-7] from agent-3");
    }

    #[test]
    fn test_malformed_lines_are_rejected() {
        assert!("no brackets here".parse::<BroadcastEvent>().is_err());
        assert!("[not-a-date] [a] msg".parse::<BroadcastEvent>().is_err());
    }
}
