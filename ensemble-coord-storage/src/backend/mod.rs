//! Shared storage substrate
//!
//! Every coordination service is written against [`StorageBackend`], so the
//! same lock and queue logic runs over an in-memory map in tests and over a
//! directory shared by several agent processes in production. The contract
//! each implementation must honor:
//!
//! - `create_exclusive` is a single atomic create-if-absent; of any number of
//!   concurrent callers on one key, at most one observes `true`.
//! - `move_atomic` relocates a record in one step; it is never observable as
//!   a copy followed by a delete.
//! - `put` replaces a record atomically; readers see the old or the new
//!   value, never a torn write.
//! - `compare_and_delete` removes a record only while it still holds the
//!   expected bytes.
//! - `append` writes one record in a single call so concurrent appends
//!   never interleave.

use async_trait::async_trait;
use ensemble_coord_core::{Error, Result};
use std::fmt;

pub mod filesystem;
pub mod memory;

#[cfg(test)]
pub(crate) mod conformance;

pub use filesystem::FileSystemBackend;
pub use memory::InMemoryBackend;

/// Key-addressed storage shared by all agents
#[async_trait]
pub trait StorageBackend: Send + Sync + fmt::Debug {
    /// Read a record
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Create or atomically replace a record
    async fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Create a record only if the key is absent. Returns `false` when it
    /// already exists.
    async fn create_exclusive(&self, key: &str, value: &[u8]) -> Result<bool>;

    /// Atomically move a record. Returns `false` when the source is missing
    /// and fails when the destination already exists.
    async fn move_atomic(&self, from: &str, to: &str) -> Result<bool>;

    /// Delete a record only if it still holds `expected`
    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool>;

    /// Delete a record unconditionally. Returns `false` when it was absent.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Keys directly under `prefix` (a partition such as `"pending"`), sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Append one complete record to an append-only stream
    async fn append(&self, key: &str, record: &[u8]) -> Result<()>;

    /// Bytes of an append-only stream from `offset` to its current end
    async fn read_from(&self, key: &str, offset: u64) -> Result<Vec<u8>>;
}

/// Join a partition prefix and a record name into a key
pub fn join_key(prefix: &str, name: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), name)
}

/// Last path segment of a key
pub fn key_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// Reject keys that could escape the store root
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key
            .split('/')
            .any(|segment| segment.is_empty() || segment == "." || segment == ".." || segment.starts_with('.'))
    {
        return Err(Error::validation(format!("Invalid storage key '{}'", key)));
    }
    Ok(())
}
