//! Batched writes: several document changes published as one commit

use crate::common::Result;
use crate::store::{Document, DocumentKey, Version};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct StagedWrite {
    pub key: DocumentKey,
    /// Version the change was computed against.
    pub expected: Version,
    pub value: Value,
}

/// Writes staged for a single atomic publish.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    writes: Vec<StagedWrite>,
    descriptions: Vec<String>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stage a raw JSON value. Staging the same key again replaces the value
    /// but keeps the first expected version.
    pub fn stage(
        &mut self,
        key: DocumentKey,
        expected: Version,
        value: Value,
        description: impl Into<String>,
    ) {
        match self.writes.iter_mut().find(|w| w.key == key) {
            Some(existing) => existing.value = value,
            None => self.writes.push(StagedWrite {
                key,
                expected,
                value,
            }),
        }
        let description = description.into();
        if !description.is_empty() {
            self.descriptions.push(description);
        }
    }

    pub fn stage_document<T: Document>(
        &mut self,
        document: &T,
        expected: Version,
        description: impl Into<String>,
    ) -> Result<()> {
        let value = serde_json::to_value(document)?;
        self.stage(T::KEY, expected, value, description);
        Ok(())
    }

    pub fn writes(&self) -> &[StagedWrite] {
        &self.writes
    }

    pub fn keys(&self) -> impl Iterator<Item = DocumentKey> + '_ {
        self.writes.iter().map(|w| w.key)
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    /// Commit message for the whole batch. A single change keeps its own
    /// description; several are listed under a summary line.
    pub fn description(&self) -> String {
        match self.descriptions.as_slice() {
            [] => format!("Update {}", self.key_list()),
            [only] => only.clone(),
            many => {
                let mut out = format!("Batch update ({} changes):", many.len());
                for d in many {
                    out.push_str("\n- ");
                    out.push_str(d);
                }
                out
            }
        }
    }

    fn key_list(&self) -> String {
        self.writes
            .iter()
            .map(|w| w.key.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    }
}
