//! In-process store shared between simulated nodes
//!
//! Same CAS semantics as the git backend: a publish is checked and applied
//! under one lock, so concurrent publishes against the same version have a
//! single winner. Fault injection makes upcoming reads or publishes fail
//! with `StoreUnavailable`.

use crate::common::{Error, Result};
use crate::store::{
    decode, encode, CoordinationStore, Document, DocumentKey, Published, Version, Versioned,
    WriteBatch,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default)]
struct MemoryState {
    docs: HashMap<DocumentKey, Vec<u8>>,
    /// Descriptions of accepted publishes, oldest first.
    history: Vec<String>,
    failing_publishes: u32,
    failing_reads: u32,
    rejected: u64,
}

/// Cloning shares the underlying documents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Write a document directly, bypassing CAS and the publish counter.
    pub fn seed<T: Document>(&self, document: &T) -> Result<()> {
        let bytes = encode(&serde_json::to_value(document)?)?;
        self.lock().docs.insert(T::KEY, bytes);
        Ok(())
    }

    /// Current copy of a document, default when missing.
    pub fn snapshot<T: Document>(&self) -> Result<T> {
        let state = self.lock();
        match state.docs.get(&T::KEY) {
            Some(bytes) => serde_json::from_slice(bytes)
                .map_err(|e| Error::invalid_document(T::KEY.as_str(), e)),
            None => Ok(T::default()),
        }
    }

    /// Make the next `n` publishes fail as if the remote were unreachable.
    pub fn fail_next_publishes(&self, n: u32) {
        self.lock().failing_publishes = n;
    }

    pub fn fail_next_reads(&self, n: u32) {
        self.lock().failing_reads = n;
    }

    /// Number of accepted publishes.
    pub fn publish_count(&self) -> usize {
        self.lock().history.len()
    }

    /// Publishes rejected for a stale expected version.
    pub fn conflict_count(&self) -> u64 {
        self.lock().rejected
    }

    pub fn history(&self) -> Vec<String> {
        self.lock().history.clone()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn read(&self, key: DocumentKey) -> Result<Versioned<Value>> {
        let mut state = self.lock();
        if state.failing_reads > 0 {
            state.failing_reads -= 1;
            return Err(Error::StoreUnavailable("injected read failure".into()));
        }
        decode(key, state.docs.get(&key).map(Vec::as_slice))
    }

    async fn publish(&self, batch: WriteBatch) -> Result<Published> {
        let mut state = self.lock();
        if state.failing_publishes > 0 {
            state.failing_publishes -= 1;
            return Err(Error::StoreUnavailable("injected publish failure".into()));
        }

        for write in batch.writes() {
            let current = state
                .docs
                .get(&write.key)
                .map(|b| Version::of(b))
                .unwrap_or_else(Version::absent);
            if current != write.expected {
                state.rejected += 1;
                return Err(Error::conflict(write.key.as_str()));
            }
        }

        let mut published = Published::new();
        let mut changed = Vec::new();
        for write in batch.writes() {
            let bytes = encode(&write.value)?;
            published.insert(write.key, Version::of(&bytes));
            if state.docs.get(&write.key) != Some(&bytes) {
                changed.push((write.key, bytes));
            }
        }

        if changed.is_empty() {
            return Ok(published);
        }
        for (key, bytes) in changed {
            state.docs.insert(key, bytes);
        }
        state.history.push(batch.description());
        Ok(published)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Roster;
    use serde_json::json;

    #[tokio::test]
    async fn test_stale_version_is_rejected() {
        let store = MemoryStore::new();
        let base = store.read(DocumentKey::Roster).await.unwrap();

        let mut first = WriteBatch::new();
        first.stage(DocumentKey::Roster, base.version.clone(), json!({"nodes": {}}), "a");
        store.publish(first).await.unwrap();

        let mut second = WriteBatch::new();
        second.stage(DocumentKey::Roster, base.version, json!({"nodes": {"x": 1}}), "b");
        let err = store.publish(second).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.publish_count(), 1);
        assert_eq!(store.conflict_count(), 1);
    }

    #[tokio::test]
    async fn test_batch_is_all_or_nothing() {
        let store = MemoryStore::new();
        store.seed(&Roster::default()).unwrap();

        let mut batch = WriteBatch::new();
        batch.stage(DocumentKey::Schedule, Version::absent(), json!({"tasks": []}), "s");
        // roster exists, so expecting it absent is stale
        batch.stage(DocumentKey::Roster, Version::absent(), json!({"nodes": {}}), "r");
        assert!(store.publish(batch).await.is_err());

        let schedule = store.read(DocumentKey::Schedule).await.unwrap();
        assert!(schedule.version.is_absent());
    }

    #[tokio::test]
    async fn test_identical_write_is_not_published() {
        let store = MemoryStore::new();
        store.seed(&Roster::default()).unwrap();
        let current = store.read(DocumentKey::Roster).await.unwrap();

        let mut batch = WriteBatch::new();
        batch.stage(DocumentKey::Roster, current.version.clone(), current.value, "noop");
        let published = store.publish(batch).await.unwrap();
        assert_eq!(published[&DocumentKey::Roster], current.version);
        assert_eq!(store.publish_count(), 0);
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let store = MemoryStore::new();
        store.fail_next_reads(1);
        assert!(store.read(DocumentKey::Roster).await.unwrap_err().is_unavailable());
        assert!(store.read(DocumentKey::Roster).await.is_ok());
    }
}
