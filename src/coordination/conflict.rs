//! Conflict resolution for concurrently edited shared documents
//!
//! Two regimes:
//! - **Eventual**: concurrent versions are merged. Lists merge by
//!   order-preserving union, scalar fields by per-field last-writer-wins.
//! - **Strong**: nothing is merged here; the losing CAS publish retries
//!   against the fresh version.
//!
//! Whole-document resolution (several regional versions of the same
//! document) is done by [`ConflictResolver`] with a [`ConflictStrategy`];
//! content writes use the same strategies to settle individual fields.

use crate::common::hash::json_digest;
use crate::model::{OperationClass, RegionalPolicy};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    #[default]
    LastWriterWins,
    RegionPriority,
    /// Oldest version wins.
    TimestampPriority,
    SemanticMerge,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::LastWriterWins => "last_writer_wins",
            ConflictStrategy::RegionPriority => "region_priority",
            ConflictStrategy::TimestampPriority => "timestamp_priority",
            ConflictStrategy::SemanticMerge => "semantic_merge",
        }
    }
}

/// Region tie-break ranks. Lower wins.
#[derive(Debug, Clone)]
pub struct RegionPriorities {
    ranks: BTreeMap<String, u32>,
    unknown: u32,
}

impl Default for RegionPriorities {
    fn default() -> Self {
        Self {
            ranks: BTreeMap::from([
                ("us-east".to_string(), 1),
                ("eu-west".to_string(), 2),
                ("asia-pacific".to_string(), 3),
                ("default".to_string(), 10),
            ]),
            unknown: 99,
        }
    }
}

impl RegionPriorities {
    /// Built-in ranks overridden by the regions listed in `policy`.
    pub fn from_policy(policy: &RegionalPolicy) -> Self {
        let mut priorities = Self::default();
        for (name, info) in &policy.regions {
            priorities.ranks.insert(name.clone(), info.priority);
        }
        priorities
    }

    pub fn rank(&self, region: &str) -> u32 {
        self.ranks.get(region).copied().unwrap_or(self.unknown)
    }
}

/// Order-preserving set union: items of `a` then unseen items of `b`,
/// duplicates collapsed by equality.
pub fn merge_union<T: PartialEq + Clone>(a: &[T], b: &[T]) -> Vec<T> {
    let mut out: Vec<T> = Vec::with_capacity(a.len() + b.len());
    for item in a.iter().chain(b.iter()) {
        if !out.contains(item) {
            out.push(item.clone());
        }
    }
    out
}

/// A scalar field tagged with who wrote it and when.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StampedValue<T> {
    pub value: T,
    pub timestamp: DateTime<Utc>,
    pub region: String,
}

impl<T: Serialize> StampedValue<T> {
    pub fn new(value: T, timestamp: DateTime<Utc>, region: impl Into<String>) -> Self {
        Self {
            value,
            timestamp,
            region: region.into(),
        }
    }

    /// Newer timestamp wins; ties go to the higher-priority region, then the
    /// smaller region name, then the smaller value digest.
    pub fn newer_of<'a>(&'a self, other: &'a Self, priorities: &RegionPriorities) -> &'a Self {
        let ordering = self
            .timestamp
            .cmp(&other.timestamp)
            .then_with(|| priorities.rank(&other.region).cmp(&priorities.rank(&self.region)))
            .then_with(|| other.region.cmp(&self.region))
            .then_with(|| value_digest(&other.value).cmp(&value_digest(&self.value)));
        if ordering == Ordering::Less {
            other
        } else {
            self
        }
    }
}

fn value_digest<T: Serialize>(value: &T) -> String {
    json_digest(&serde_json::to_value(value).unwrap_or(Value::Null))
}

/// Merge two per-field maps. Keys present on both sides go through `pick`,
/// which must not depend on argument order.
pub fn merge_fields<T, F>(
    a: &BTreeMap<String, StampedValue<T>>,
    b: &BTreeMap<String, StampedValue<T>>,
    mut pick: F,
) -> BTreeMap<String, StampedValue<T>>
where
    T: Clone,
    F: FnMut(&StampedValue<T>, &StampedValue<T>) -> StampedValue<T>,
{
    let mut out = a.clone();
    for (key, theirs) in b {
        let winner = match a.get(key) {
            Some(ours) => pick(ours, theirs),
            None => theirs.clone(),
        };
        out.insert(key.clone(), winner);
    }
    out
}

/// One region's copy of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictedVersion {
    pub region: String,
    pub timestamp: DateTime<Utc>,
    pub data: Value,
    pub content_hash: String,
}

impl ConflictedVersion {
    pub fn new(region: impl Into<String>, timestamp: DateTime<Utc>, data: Value) -> Self {
        let content_hash = json_digest(&data);
        Self {
            region: region.into(),
            timestamp,
            data,
            content_hash,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub data: Value,
    pub strategy: String,
    pub conflicts_detected: usize,
    pub regions_involved: Vec<String>,
    pub winning_region: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConflictResolver {
    priorities: RegionPriorities,
}

impl ConflictResolver {
    pub fn new(priorities: RegionPriorities) -> Self {
        Self { priorities }
    }

    pub fn priorities(&self) -> &RegionPriorities {
        &self.priorities
    }

    /// Settle two writes of one scalar field with `strategy`. A scalar has
    /// nothing to merge, so `SemanticMerge` settles it by last writer.
    pub fn resolve_field<T>(
        &self,
        ours: &StampedValue<T>,
        theirs: &StampedValue<T>,
        strategy: ConflictStrategy,
    ) -> StampedValue<T>
    where
        T: Clone + PartialEq + Serialize + DeserializeOwned,
    {
        if ours == theirs {
            return ours.clone();
        }
        let strategy = match strategy {
            ConflictStrategy::SemanticMerge => ConflictStrategy::LastWriterWins,
            other => other,
        };
        let versions = [ours, theirs].map(|v| {
            let data = serde_json::to_value(v).unwrap_or(Value::Null);
            ConflictedVersion::new(v.region.clone(), v.timestamp, data)
        });
        self.resolve(&versions, OperationClass::ContentUpdates, strategy)
            .and_then(|r| serde_json::from_value(r.data).ok())
            .unwrap_or_else(|| ours.newer_of(theirs, &self.priorities).clone())
    }

    /// Resolve several versions of one document. `None` for an empty input.
    pub fn resolve(
        &self,
        versions: &[ConflictedVersion],
        class: OperationClass,
        strategy: ConflictStrategy,
    ) -> Option<Resolution> {
        let regions: Vec<String> = versions.iter().map(|v| v.region.clone()).collect();
        match versions {
            [] => return None,
            [only] => {
                return Some(Resolution {
                    data: only.data.clone(),
                    strategy: "no_conflict".to_string(),
                    conflicts_detected: 0,
                    regions_involved: regions,
                    winning_region: Some(only.region.clone()),
                })
            }
            _ => {}
        }

        tracing::info!(
            "Resolving {} conflicting versions of {} with {}",
            versions.len(),
            class,
            strategy.as_str()
        );

        let conflicts = versions.len() - 1;
        let pick = |winner: &ConflictedVersion, name: &str| Resolution {
            data: winner.data.clone(),
            strategy: name.to_string(),
            conflicts_detected: conflicts,
            regions_involved: regions.clone(),
            winning_region: Some(winner.region.clone()),
        };

        let resolution = match strategy {
            ConflictStrategy::LastWriterWins => pick(self.newest(versions), "last_writer_wins"),
            ConflictStrategy::RegionPriority => {
                pick(self.by_region_priority(versions), "region_priority")
            }
            ConflictStrategy::TimestampPriority => {
                pick(self.oldest(versions), "timestamp_priority")
            }
            ConflictStrategy::SemanticMerge => match class {
                OperationClass::ContentUpdates => Resolution {
                    data: self.merge_content(versions),
                    strategy: "semantic_merge_content".to_string(),
                    conflicts_detected: conflicts,
                    regions_involved: regions.clone(),
                    winning_region: None,
                },
                OperationClass::NodeRoster => Resolution {
                    data: merge_rosters(versions),
                    strategy: "semantic_merge_roster".to_string(),
                    conflicts_detected: conflicts,
                    regions_involved: regions.clone(),
                    winning_region: None,
                },
                OperationClass::ScheduleChanges => {
                    pick(self.by_region_priority(versions), "region_priority")
                }
                OperationClass::Assignments => pick(self.newest(versions), "last_writer_wins"),
            },
        };
        Some(resolution)
    }

    fn canonical<'a>(&self, versions: &'a [ConflictedVersion]) -> Vec<&'a ConflictedVersion> {
        let mut sorted: Vec<&ConflictedVersion> = versions.iter().collect();
        sorted.sort_by(|a, b| {
            a.content_hash
                .cmp(&b.content_hash)
                .then_with(|| a.region.cmp(&b.region))
        });
        sorted
    }

    fn newest<'a>(&self, versions: &'a [ConflictedVersion]) -> &'a ConflictedVersion {
        self.canonical(versions)
            .into_iter()
            .min_by(|a, b| {
                b.timestamp
                    .cmp(&a.timestamp)
                    .then_with(|| self.rank_order(a, b))
                    .then_with(|| a.region.cmp(&b.region))
            })
            .unwrap_or(&versions[0])
    }

    fn oldest<'a>(&self, versions: &'a [ConflictedVersion]) -> &'a ConflictedVersion {
        self.canonical(versions)
            .into_iter()
            .min_by(|a, b| {
                a.timestamp
                    .cmp(&b.timestamp)
                    .then_with(|| self.rank_order(a, b))
                    .then_with(|| a.region.cmp(&b.region))
            })
            .unwrap_or(&versions[0])
    }

    fn rank_order(&self, a: &ConflictedVersion, b: &ConflictedVersion) -> Ordering {
        self.priorities
            .rank(&a.region)
            .cmp(&self.priorities.rank(&b.region))
    }

    /// Configured region priority, then earliest timestamp.
    fn by_region_priority<'a>(
        &self,
        versions: &'a [ConflictedVersion],
    ) -> &'a ConflictedVersion {
        self.canonical(versions)
            .into_iter()
            .min_by(|a, b| {
                self.rank_order(a, b)
                    .then_with(|| a.timestamp.cmp(&b.timestamp))
                    .then_with(|| a.region.cmp(&b.region))
            })
            .unwrap_or(&versions[0])
    }

    /// Union of `items` across versions; other fields come from the newest version.
    fn merge_content(&self, versions: &[ConflictedVersion]) -> Value {
        let mut items: Vec<Value> = Vec::new();
        for version in self.canonical(versions) {
            if let Some(list) = version.data.get("items").and_then(Value::as_array) {
                items = merge_union(&items, list);
            }
        }
        let mut merged = match &self.newest(versions).data {
            Value::Object(map) => map.clone(),
            _ => serde_json::Map::new(),
        };
        merged.insert("items".to_string(), Value::Array(items));
        Value::Object(merged)
    }
}

/// Newest heartbeat per node across all versions of the roster.
fn merge_rosters(versions: &[ConflictedVersion]) -> Value {
    let mut nodes: BTreeMap<String, Value> = BTreeMap::new();
    for version in versions {
        let Some(map) = version.data.get("nodes").and_then(Value::as_object) else {
            continue;
        };
        for (id, node) in map {
            let incoming = heartbeat_of(node);
            let replace = match nodes.get(id) {
                Some(existing) => incoming > heartbeat_of(existing),
                None => true,
            };
            if replace {
                let mut node = node.clone();
                if let Value::Object(fields) = &mut node {
                    fields
                        .entry("region")
                        .or_insert_with(|| Value::String(version.region.clone()));
                }
                nodes.insert(id.clone(), node);
            }
        }
    }
    serde_json::json!({ "nodes": nodes })
}

fn heartbeat_of(node: &Value) -> Option<DateTime<Utc>> {
    node.get("last_heartbeat")
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_union_preserves_first_seen_order() {
        let merged = merge_union(&["A", "B"], &["A", "C"]);
        assert_eq!(merged, vec!["A", "B", "C"]);
        assert_eq!(merge_union(&["X", "Y"], &["X", "Y"]), vec!["X", "Y"]);
    }

    #[test]
    fn test_stamped_value_newest_wins() {
        let now = Utc::now();
        let priorities = RegionPriorities::default();
        let old = StampedValue::new("old", now - Duration::seconds(5), "us-east");
        let new = StampedValue::new("new", now, "asia-pacific");
        assert_eq!(old.newer_of(&new, &priorities).value, "new");
        assert_eq!(new.newer_of(&old, &priorities).value, "new");
    }

    #[test]
    fn test_stamped_value_tie_uses_region_priority() {
        let now = Utc::now();
        let priorities = RegionPriorities::default();
        let us = StampedValue::new("us", now, "us-east");
        let eu = StampedValue::new("eu", now, "eu-west");
        assert_eq!(us.newer_of(&eu, &priorities).value, "us");
        assert_eq!(eu.newer_of(&us, &priorities).value, "us");
    }

    #[test]
    fn test_region_priority_resolution() {
        let now = Utc::now();
        let resolver = ConflictResolver::default();
        let versions = vec![
            ConflictedVersion::new("asia-pacific", now - Duration::seconds(10), json!({"v": 1})),
            ConflictedVersion::new("us-east", now, json!({"v": 2})),
        ];
        let res = resolver
            .resolve(
                &versions,
                OperationClass::ScheduleChanges,
                ConflictStrategy::RegionPriority,
            )
            .unwrap();
        assert_eq!(res.data, json!({"v": 2}));
        assert_eq!(res.winning_region.as_deref(), Some("us-east"));
        assert_eq!(res.conflicts_detected, 1);

        let oldest = resolver
            .resolve(
                &versions,
                OperationClass::ScheduleChanges,
                ConflictStrategy::TimestampPriority,
            )
            .unwrap();
        assert_eq!(oldest.data, json!({"v": 1}));
    }

    #[test]
    fn test_semantic_merge_of_content() {
        let now = Utc::now();
        let resolver = ConflictResolver::default();
        let versions = vec![
            ConflictedVersion::new("us-east", now, json!({"items": ["a", "b"], "title": "x"})),
            ConflictedVersion::new("eu-west", now, json!({"items": ["a", "c"], "title": "x"})),
        ];
        let forward = resolver
            .resolve(&versions, OperationClass::ContentUpdates, ConflictStrategy::SemanticMerge)
            .unwrap();
        let reversed: Vec<_> = versions.iter().rev().cloned().collect();
        let backward = resolver
            .resolve(&reversed, OperationClass::ContentUpdates, ConflictStrategy::SemanticMerge)
            .unwrap();
        assert_eq!(forward.data, backward.data);
        let items = forward.data["items"].as_array().unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(forward.data["title"], "x");
    }

    #[test]
    fn test_semantic_merge_of_rosters_keeps_newest_heartbeat() {
        let now = Utc::now();
        let resolver = ConflictResolver::default();
        let early = (now - Duration::minutes(1)).to_rfc3339();
        let late = now.to_rfc3339();
        let versions = vec![
            ConflictedVersion::new(
                "us-east",
                now,
                json!({"nodes": {"n1": {"last_heartbeat": late}}}),
            ),
            ConflictedVersion::new(
                "eu-west",
                now,
                json!({"nodes": {
                    "n1": {"last_heartbeat": early},
                    "n2": {"last_heartbeat": early},
                }}),
            ),
        ];
        let res = resolver
            .resolve(&versions, OperationClass::NodeRoster, ConflictStrategy::SemanticMerge)
            .unwrap();
        assert_eq!(res.data["nodes"]["n1"]["last_heartbeat"], late);
        assert_eq!(res.data["nodes"]["n1"]["region"], "us-east");
        assert_eq!(res.data["nodes"]["n2"]["region"], "eu-west");
    }

    #[test]
    fn test_field_resolution_follows_strategy() {
        let now = Utc::now();
        let resolver = ConflictResolver::default();
        let early_us = StampedValue::new(json!("morning"), now - Duration::seconds(30), "us-east");
        let late_eu = StampedValue::new(json!("evening"), now, "eu-west");

        let pick = |strategy| {
            let forward = resolver.resolve_field(&early_us, &late_eu, strategy);
            assert_eq!(forward, resolver.resolve_field(&late_eu, &early_us, strategy));
            forward.value
        };
        assert_eq!(pick(ConflictStrategy::LastWriterWins), json!("evening"));
        assert_eq!(pick(ConflictStrategy::SemanticMerge), json!("evening"));
        assert_eq!(pick(ConflictStrategy::TimestampPriority), json!("morning"));
        assert_eq!(pick(ConflictStrategy::RegionPriority), json!("morning"));
    }

    #[test]
    fn test_single_version_is_not_a_conflict() {
        let resolver = ConflictResolver::default();
        let versions = vec![ConflictedVersion::new("us-east", Utc::now(), json!(1))];
        let res = resolver
            .resolve(&versions, OperationClass::Assignments, ConflictStrategy::LastWriterWins)
            .unwrap();
        assert_eq!(res.strategy, "no_conflict");
        assert!(resolver
            .resolve(&[], OperationClass::Assignments, ConflictStrategy::LastWriterWins)
            .is_none());
    }
}
