//! Regional policy document for geo-distributed swarms

use crate::coordination::conflict::ConflictStrategy;
use crate::model::node::default_region;
use crate::store::{Document, DocumentKey};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Classes of shared writes, each with its own consistency policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    #[serde(alias = "shortlist_updates")]
    ContentUpdates,
    ScheduleChanges,
    NodeRoster,
    Assignments,
}

impl OperationClass {
    pub const ALL: [OperationClass; 4] = [
        OperationClass::ContentUpdates,
        OperationClass::ScheduleChanges,
        OperationClass::NodeRoster,
        OperationClass::Assignments,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            OperationClass::ContentUpdates => "content_updates",
            OperationClass::ScheduleChanges => "schedule_changes",
            OperationClass::NodeRoster => "node_roster",
            OperationClass::Assignments => "assignments",
        }
    }
}

impl fmt::Display for OperationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "consistency", rename_all = "lowercase")]
pub enum ConsistencyPolicy {
    /// Concurrent writes are merged; replicas may lag by up to `max_lag_seconds`.
    Eventual {
        #[serde(default = "default_max_lag")]
        max_lag_seconds: u64,
        #[serde(default)]
        conflict_resolution: ConflictStrategy,
    },
    /// Single CAS publish, allowed only while `quorum` nodes are alive.
    Strong {
        #[serde(default = "default_quorum")]
        quorum: usize,
    },
}

fn default_max_lag() -> u64 {
    60
}

fn default_quorum() -> usize {
    1
}

impl Default for ConsistencyPolicy {
    fn default() -> Self {
        ConsistencyPolicy::Eventual {
            max_lag_seconds: default_max_lag(),
            conflict_resolution: ConflictStrategy::LastWriterWins,
        }
    }
}

impl ConsistencyPolicy {
    pub fn is_strong(&self) -> bool {
        matches!(self, ConsistencyPolicy::Strong { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionInfo {
    /// Lower wins tie-breaks.
    #[serde(default = "default_region_priority")]
    pub priority: u32,
    #[serde(default = "default_weight")]
    pub weight: f64,
}

fn default_region_priority() -> u32 {
    5
}

fn default_weight() -> f64 {
    1.0
}

/// `regional_policy.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegionalPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_region")]
    pub default_region: String,
    #[serde(default)]
    pub regions: BTreeMap<String, RegionInfo>,
    /// Region name to the task-id substrings it owns.
    #[serde(default)]
    pub ownership: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_consistency")]
    pub consistency: BTreeMap<OperationClass, ConsistencyPolicy>,
}

fn default_consistency() -> BTreeMap<OperationClass, ConsistencyPolicy> {
    BTreeMap::from([
        (
            OperationClass::ContentUpdates,
            ConsistencyPolicy::Eventual {
                max_lag_seconds: 30,
                conflict_resolution: ConflictStrategy::SemanticMerge,
            },
        ),
        (
            OperationClass::ScheduleChanges,
            ConsistencyPolicy::Strong { quorum: 1 },
        ),
        (
            OperationClass::NodeRoster,
            ConsistencyPolicy::Eventual {
                max_lag_seconds: 60,
                conflict_resolution: ConflictStrategy::LastWriterWins,
            },
        ),
        (
            OperationClass::Assignments,
            ConsistencyPolicy::Strong { quorum: 1 },
        ),
    ])
}

impl Default for RegionalPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            default_region: default_region(),
            regions: BTreeMap::from([(
                default_region(),
                RegionInfo {
                    priority: 1,
                    weight: 1.0,
                },
            )]),
            ownership: BTreeMap::new(),
            consistency: default_consistency(),
        }
    }
}

impl Document for RegionalPolicy {
    const KEY: DocumentKey = DocumentKey::RegionalPolicy;
}

impl RegionalPolicy {
    /// Policy for an operation class; unlisted classes are eventual with LWW.
    pub fn consistency_for(&self, class: OperationClass) -> ConsistencyPolicy {
        self.consistency.get(&class).cloned().unwrap_or_default()
    }

    /// Region owning `task_id`, if any pattern matches. The first region in
    /// name order wins when several do.
    pub fn owner_of(&self, task_id: &str) -> Option<&str> {
        self.ownership
            .iter()
            .find(|(_, patterns)| {
                patterns
                    .iter()
                    .any(|p| !p.is_empty() && task_id.contains(p.as_str()))
            })
            .map(|(region, _)| region.as_str())
    }

    pub fn load_from_file(path: &std::path::Path) -> crate::Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| crate::Error::invalid_document(path.display().to_string(), e))
    }
}
