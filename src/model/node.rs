//! Swarm membership: nodes and the roster document

use crate::common::NodeState;
use crate::coordination::roles::RoleSet;
use crate::model::TaskId;
use crate::store::{Document, DocumentKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

pub type NodeId = String;

/// Host gauges reported with every roster heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetrics {
    #[serde(default)]
    pub cpu_percent: f64,
    #[serde(default)]
    pub memory_percent: f64,
    /// Free-form named gauges (queue depth, temperature, ...)
    #[serde(flatten)]
    pub gauges: BTreeMap<String, f64>,
}

impl NodeMetrics {
    /// Look up a metric by name. `cpu` and `memory` are accepted as short forms.
    pub fn get(&self, name: &str) -> Option<f64> {
        match name {
            "cpu_percent" | "cpu" => Some(self.cpu_percent),
            "memory_percent" | "memory" => Some(self.memory_percent),
            other => self.gauges.get(other).copied(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub roles: RoleSet,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub metrics: NodeMetrics,
    /// Task the node was working on at its last heartbeat.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_task: Option<TaskId>,
}

pub(crate) fn default_region() -> String {
    crate::coordination::geo::DEFAULT_REGION.to_string()
}

impl Node {
    pub fn new(
        id: impl Into<NodeId>,
        region: impl Into<String>,
        roles: RoleSet,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            region: region.into(),
            roles,
            started_at: now,
            last_heartbeat: now,
            metrics: NodeMetrics::default(),
            current_task: None,
        }
    }

    pub fn state(&self, now: DateTime<Utc>, node_timeout: Duration) -> NodeState {
        NodeState::from_heartbeat(self.last_heartbeat, now, node_timeout)
    }

    pub fn is_alive(&self, now: DateTime<Utc>, node_timeout: Duration) -> bool {
        self.state(now, node_timeout).is_alive()
    }
}

/// `roster.json`: every node that has announced itself.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Roster {
    #[serde(default)]
    pub nodes: BTreeMap<NodeId, Node>,
}

impl Document for Roster {
    const KEY: DocumentKey = DocumentKey::Roster;
}

impl Roster {
    pub fn get(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn upsert(&mut self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn remove(&mut self, id: &str) -> Option<Node> {
        self.nodes.remove(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn alive<'a>(
        &'a self,
        now: DateTime<Utc>,
        node_timeout: Duration,
    ) -> impl Iterator<Item = &'a Node> + 'a {
        self.nodes
            .values()
            .filter(move |n| n.is_alive(now, node_timeout))
    }

    pub fn alive_count(&self, now: DateTime<Utc>, node_timeout: Duration) -> usize {
        self.alive(now, node_timeout).count()
    }

    /// Ids of nodes whose heartbeat is older than `node_timeout`.
    pub fn stale_ids(&self, now: DateTime<Utc>, node_timeout: Duration) -> Vec<NodeId> {
        self.nodes
            .values()
            .filter(|n| !n.is_alive(now, node_timeout))
            .map(|n| n.id.clone())
            .collect()
    }

    /// Present and heartbeating.
    pub fn is_node_alive(&self, id: &str, now: DateTime<Utc>, node_timeout: Duration) -> bool {
        self.nodes
            .get(id)
            .is_some_and(|n| n.is_alive(now, node_timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn node(id: &str, age_secs: i64, now: DateTime<Utc>) -> Node {
        let mut n = Node::new(id, "default", RoleSet::all(), now);
        n.last_heartbeat = now - ChronoDuration::seconds(age_secs);
        n
    }

    #[test]
    fn test_liveness_uses_strict_timeout() {
        let now = Utc::now();
        let timeout = Duration::from_secs(900);
        assert!(node("a", 899, now).is_alive(now, timeout));
        assert!(!node("b", 900, now).is_alive(now, timeout));
    }

    #[test]
    fn test_stale_ids_and_alive_count() {
        let now = Utc::now();
        let mut roster = Roster::default();
        roster.upsert(node("fresh", 10, now));
        roster.upsert(node("stale", 5000, now));
        let timeout = Duration::from_secs(900);
        assert_eq!(roster.alive_count(now, timeout), 1);
        assert_eq!(roster.stale_ids(now, timeout), vec!["stale".to_string()]);
        assert!(!roster.is_node_alive("missing", now, timeout));
    }

    #[test]
    fn test_metrics_lookup_and_gauges() {
        let json = r#"{"cpu_percent": 40.0, "memory_percent": 10.5, "queue_depth": 7}"#;
        let metrics: NodeMetrics = serde_json::from_str(json).unwrap();
        assert_eq!(metrics.get("cpu"), Some(40.0));
        assert_eq!(metrics.get("memory_percent"), Some(10.5));
        assert_eq!(metrics.get("queue_depth"), Some(7.0));
        assert_eq!(metrics.get("disk"), None);
    }
}
