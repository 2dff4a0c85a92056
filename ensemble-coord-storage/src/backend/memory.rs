//! In-memory backend for tests and single-process deployments

use super::{validate_key, StorageBackend};
use async_trait::async_trait;
use ensemble_coord_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Map-backed store. Clones share the same underlying map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    records: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored records, streams included
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[async_trait]
impl StorageBackend for InMemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.records.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.records.lock().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn create_exclusive(&self, key: &str, value: &[u8]) -> Result<bool> {
        validate_key(key)?;
        let mut records = self.records.lock();
        if records.contains_key(key) {
            return Ok(false);
        }
        records.insert(key.to_string(), value.to_vec());
        Ok(true)
    }

    async fn move_atomic(&self, from: &str, to: &str) -> Result<bool> {
        validate_key(from)?;
        validate_key(to)?;
        let mut records = self.records.lock();
        if !records.contains_key(from) {
            return Ok(false);
        }
        if records.contains_key(to) {
            return Err(Error::storage(
                format!("move {} -> {}", from, to),
                "destination already exists",
            ));
        }
        if let Some(value) = records.remove(from) {
            records.insert(to.to_string(), value);
        }
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, expected: &[u8]) -> Result<bool> {
        validate_key(key)?;
        let mut records = self.records.lock();
        match records.get(key) {
            Some(current) if current.as_slice() == expected => {
                records.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.records.lock().remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = format!("{}/", prefix.trim_end_matches('/'));
        let records = self.records.lock();
        Ok(records
            .range(dir.clone()..)
            .take_while(|(key, _)| key.starts_with(&dir))
            .filter(|(key, _)| !key[dir.len()..].contains('/'))
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn append(&self, key: &str, record: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.records
            .lock()
            .entry(key.to_string())
            .or_default()
            .extend_from_slice(record);
        Ok(())
    }

    async fn read_from(&self, key: &str, offset: u64) -> Result<Vec<u8>> {
        validate_key(key)?;
        let records = self.records.lock();
        let Some(stream) = records.get(key) else {
            return Ok(Vec::new());
        };
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(stream.len());
        Ok(stream[start..].to_vec())
    }
}
