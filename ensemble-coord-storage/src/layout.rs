//! Key layout of the shared store
//!
//! ```text
//! pending/<id>.json          work items waiting for a claimant
//! active/<id>.json           claimed work items
//! completed/<id>.json        finished work items (terminal)
//! ids/<id>                   id reservations, one per item ever enqueued
//! locks/<key>.lock           lock records
//! agents/<id>.json           agent liveness records
//! agents/<id>.dead           death certificate, created once by a sweeper
//! clarifications/<id>.json   open clarification requests
//! clarifications/<id>.answer answer or expiry marker
//! broadcast.log              append-only event stream
//! ```

use crate::backend::{join_key, key_name};
use ensemble_coord_core::work_item::WorkItemStatus;

pub const IDS: &str = "ids";
pub const LOCKS: &str = "locks";
pub const AGENTS: &str = "agents";
pub const CLARIFICATIONS: &str = "clarifications";
pub const BROADCAST_LOG: &str = "broadcast.log";

const JSON_EXT: &str = ".json";
const LOCK_EXT: &str = ".lock";
const ANSWER_EXT: &str = ".answer";
const DEAD_EXT: &str = ".dead";

pub fn partition(status: WorkItemStatus) -> &'static str {
    status.as_str()
}

pub fn item_key(status: WorkItemStatus, item_id: &str) -> String {
    join_key(partition(status), &format!("{}{}", item_id, JSON_EXT))
}

pub fn id_reservation_key(item_id: &str) -> String {
    join_key(IDS, item_id)
}

pub fn agent_key(agent_id: &str) -> String {
    join_key(AGENTS, &format!("{}{}", agent_id, JSON_EXT))
}

pub fn dead_marker_key(agent_id: &str) -> String {
    join_key(AGENTS, &format!("{}{}", agent_id, DEAD_EXT))
}

pub fn clarification_key(request_id: &str) -> String {
    join_key(CLARIFICATIONS, &format!("{}{}", request_id, JSON_EXT))
}

pub fn answer_key(request_id: &str) -> String {
    join_key(CLARIFICATIONS, &format!("{}{}", request_id, ANSWER_EXT))
}

/// Lock keys are arbitrary strings; encode them into a safe file name
pub fn lock_key(resource_key: &str) -> String {
    join_key(LOCKS, &format!("{}{}", encode_segment(resource_key), LOCK_EXT))
}

/// Record id of a `.json` key, if the key is one
pub fn json_record_id(key: &str) -> Option<&str> {
    key_name(key).strip_suffix(JSON_EXT)
}

pub fn is_lock_key(key: &str) -> bool {
    key_name(key).ends_with(LOCK_EXT)
}

fn encode_segment(raw: &str) -> String {
    let mut encoded = String::with_capacity(raw.len());
    for (index, byte) in raw.bytes().enumerate() {
        let safe = byte.is_ascii_alphanumeric()
            || byte == b'-'
            || byte == b'_'
            || (byte == b'.' && index > 0);
        if safe {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("%{:02X}", byte));
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_item_keys_follow_partitions() {
        assert_eq!(item_key(WorkItemStatus::Pending, "42"), "pending/42.json");
        assert_eq!(item_key(WorkItemStatus::Completed, "42"), "completed/42.json");
        assert_eq!(json_record_id("active/42.json"), Some("42"));
        assert_eq!(json_record_id("clarifications/q.answer"), None);
    }

    #[test]
    fn test_lock_keys_are_encoded() {
        assert_eq!(lock_key("item:42"), "locks/item%3A42.lock");
        assert_eq!(lock_key("a/b"), "locks/a%2Fb.lock");
        assert_eq!(lock_key(".hidden"), "locks/%2Ehidden.lock");
        assert!(is_lock_key(&lock_key("x")));
    }
}
