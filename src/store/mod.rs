//! Versioned document store over the shared coordination repository
//!
//! Documents are read whole and written back whole with an expected
//! [`Version`]. A publish is accepted only if every expected version still
//! matches, which makes it the swarm's only compare-and-swap primitive.
//!
//! ```text
//!   node A ── read(v1) ── mutate ── publish(expect v1) ──► accepted (v2)
//!   node B ── read(v1) ── mutate ── publish(expect v1) ──► StoreConflict
//!                                        └── re-read(v2), mutate, publish
//! ```

pub mod batch;
pub mod git;
pub mod memory;

pub use batch::{StagedWrite, WriteBatch};
pub use git::{GitStore, GitStoreConfig};
pub use memory::MemoryStore;

use crate::common::{blake3_hash, Error, Result, RetryPolicy};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Shared documents known to the swarm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DocumentKey {
    Roster,
    Schedule,
    Assignments,
    Triggers,
    RegionalPolicy,
    Shortlist,
}

impl DocumentKey {
    pub const ALL: [DocumentKey; 6] = [
        DocumentKey::Roster,
        DocumentKey::Schedule,
        DocumentKey::Assignments,
        DocumentKey::Triggers,
        DocumentKey::RegionalPolicy,
        DocumentKey::Shortlist,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentKey::Roster => "roster",
            DocumentKey::Schedule => "schedule",
            DocumentKey::Assignments => "assignments",
            DocumentKey::Triggers => "triggers",
            DocumentKey::RegionalPolicy => "regional_policy",
            DocumentKey::Shortlist => "shortlist",
        }
    }

    /// File name inside the repository.
    pub fn file_name(&self) -> String {
        format!("{}.json", self.as_str())
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed shared document.
pub trait Document: Serialize + DeserializeOwned + Default + Clone + Send + Sync + 'static {
    const KEY: DocumentKey;
}

/// CAS token: BLAKE3 digest of the document's bytes, or absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version(Option<String>);

impl Version {
    pub fn absent() -> Self {
        Version(None)
    }

    pub fn of(bytes: &[u8]) -> Self {
        Version(Some(blake3_hash(bytes)))
    }

    pub fn is_absent(&self) -> bool {
        self.0.is_none()
    }

    pub fn digest(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(digest) => f.write_str(&digest[..digest.len().min(12)]),
            None => f.write_str("absent"),
        }
    }
}

/// A document together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub value: T,
    pub version: Version,
}

impl<T> Versioned<T> {
    pub fn new(value: T, version: Version) -> Self {
        Self { value, version }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Versioned<U> {
        Versioned {
            value: f(self.value),
            version: self.version,
        }
    }
}

/// New versions of the documents written by one publish.
pub type Published = BTreeMap<DocumentKey, Version>;

/// Canonical on-disk encoding: pretty JSON with a trailing newline.
pub fn encode(value: &Value) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse stored bytes. Missing documents read as `null`.
pub fn decode(key: DocumentKey, bytes: Option<&[u8]>) -> Result<Versioned<Value>> {
    match bytes {
        None => Ok(Versioned::new(Value::Null, Version::absent())),
        Some(bytes) => {
            let value = serde_json::from_slice(bytes)
                .map_err(|e| Error::invalid_document(key.as_str(), e))?;
            Ok(Versioned::new(value, Version::of(bytes)))
        }
    }
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Latest state of a document and its version.
    async fn read(&self, key: DocumentKey) -> Result<Versioned<Value>>;

    /// Commit every write of the batch as one atomic publish, or fail with
    /// `StoreConflict` if any expected version is stale. Writes that change
    /// nothing are not published.
    async fn publish(&self, batch: WriteBatch) -> Result<Published>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Read a typed document. Missing documents read as `T::default()`.
pub async fn read_document<T: Document>(store: &dyn CoordinationStore) -> Result<Versioned<T>> {
    let raw = store.read(T::KEY).await?;
    if raw.value.is_null() {
        return Ok(Versioned::new(T::default(), raw.version));
    }
    let value = serde_json::from_value(raw.value)
        .map_err(|e| Error::invalid_document(T::KEY.as_str(), e))?;
    Ok(Versioned::new(value, raw.version))
}

/// What a mutate function decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    /// The document changed; the string becomes the publish description.
    Changed(String),
    /// Nothing to write.
    Unchanged,
    /// Give up without writing.
    Abort(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOutcome<T> {
    Written { value: T, version: Version },
    Unchanged(T),
    Aborted(String),
}

impl<T> WriteOutcome<T> {
    pub fn is_written(&self) -> bool {
        matches!(self, WriteOutcome::Written { .. })
    }
}

/// Read-modify-write of one document under optimistic concurrency.
///
/// `mutate` runs against the freshest copy on every attempt, so it must be
/// safe to call more than once. Conflicts and outages are retried according
/// to `policy`; exhausting it surfaces the last error.
pub async fn compare_and_write<T, F>(
    store: &dyn CoordinationStore,
    policy: &RetryPolicy,
    mut mutate: F,
) -> Result<WriteOutcome<T>>
where
    T: Document,
    F: FnMut(&mut T) -> Mutation,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = write_once(store, &mut mutate).await;

        match result {
            Err(e) if policy.should_retry(&e, attempt) => {
                let delay = policy.backoff(&e, attempt);
                tracing::debug!(
                    "{} write attempt {} failed: {}, retrying in {:?}",
                    T::KEY,
                    attempt,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            other => return other,
        }
    }
}

async fn write_once<T, F>(store: &dyn CoordinationStore, mutate: &mut F) -> Result<WriteOutcome<T>>
where
    T: Document,
    F: FnMut(&mut T) -> Mutation,
{
    let current = read_document::<T>(store).await?;
    let mut value = current.value;
    match mutate(&mut value) {
        Mutation::Unchanged => Ok(WriteOutcome::Unchanged(value)),
        Mutation::Abort(reason) => Ok(WriteOutcome::Aborted(reason)),
        Mutation::Changed(description) => {
            let mut batch = WriteBatch::new();
            batch.stage_document(&value, current.version, description)?;
            let published = store.publish(batch).await?;
            let version = published
                .get(&T::KEY)
                .cloned()
                .unwrap_or_else(Version::absent);
            Ok(WriteOutcome::Written { value, version })
        }
    }
}
