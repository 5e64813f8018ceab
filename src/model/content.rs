//! The shared content list, written under eventual consistency

use crate::coordination::conflict::{
    merge_fields, merge_union, ConflictResolver, ConflictStrategy, RegionPriorities, StampedValue,
};
use crate::store::{Document, DocumentKey};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// `shortlist.json`: curated items plus a few scalar settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContentList {
    #[serde(default)]
    pub items: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fields: BTreeMap<String, StampedValue<Value>>,
}

impl Document for ContentList {
    const KEY: DocumentKey = DocumentKey::Shortlist;
}

impl ContentList {
    /// Merge two concurrently edited copies. Items keep `self`'s order with
    /// unseen items of `other` appended; fields are resolved per key by
    /// last-writer-wins. Both argument orders yield the same item set and
    /// the same fields.
    pub fn merge(&self, other: &ContentList, priorities: &RegionPriorities) -> ContentList {
        ContentList {
            items: merge_union(&self.items, &other.items),
            fields: merge_fields(&self.fields, &other.fields, |ours, theirs| {
                ours.newer_of(theirs, priorities).clone()
            }),
        }
    }

    /// [`ContentList::merge`] with fields settled by `strategy`.
    pub fn merge_with(
        &self,
        other: &ContentList,
        resolver: &ConflictResolver,
        strategy: ConflictStrategy,
    ) -> ContentList {
        ContentList {
            items: merge_union(&self.items, &other.items),
            fields: merge_fields(&self.fields, &other.fields, |ours, theirs| {
                resolver.resolve_field(ours, theirs, strategy)
            }),
        }
    }

    pub fn set_field(&mut self, name: impl Into<String>, value: StampedValue<Value>) {
        self.fields.insert(name.into(), value);
    }
}
