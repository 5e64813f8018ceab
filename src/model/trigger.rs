//! Governor rules: conditions, quorum requirements and schedule actions

use crate::model::{Task, TaskId};
use crate::store::{Document, DocumentKey};
use serde::{Deserialize, Serialize};
use std::fmt;

/// `triggers.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerSet {
    #[serde(default)]
    pub rules: Vec<Trigger>,
}

impl Document for TriggerSet {
    const KEY: DocumentKey = DocumentKey::Triggers;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quorum: Option<Quorum>,
    pub condition: Condition,
    pub action: Action,
}

fn enabled_by_default() -> bool {
    true
}

/// Minimum swarm health required before a trigger is even evaluated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Quorum {
    pub min_nodes_alive: usize,
    /// Percentage of roster nodes that must be alive (0-100).
    pub min_percent_alive: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    /// UTC wall-clock window. Both bounds optional; no bounds is always true.
    TimeBased {
        /// Inclusive `[start, end]` hours; `start > end` wraps midnight.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hour_range: Option<(u32, u32)>,
        /// 0 = Monday .. 6 = Sunday
        #[serde(default, alias = "weekday", skip_serializing_if = "Option::is_none")]
        weekdays: Option<Vec<u32>>,
    },
    #[serde(alias = "swarm_metric_agg")]
    SwarmMetric {
        metric: String,
        #[serde(default)]
        aggregate: MetricAggregate,
        #[serde(default)]
        operator: Comparison,
        threshold: f64,
    },
    TaskMetric {
        aggregate: TaskAggregate,
        #[serde(default)]
        operator: Comparison,
        threshold: f64,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricAggregate {
    #[default]
    #[serde(alias = "avg", alias = "mean")]
    Average,
    Max,
    Min,
    Sum,
    Count,
}

/// Counts over the schedule and the assignments document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAggregate {
    /// Tasks with a live lease
    Assigned,
    Unassigned,
    Total,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparison {
    #[serde(rename = ">")]
    Gt,
    #[default]
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "==")]
    Eq,
}

/// Tolerance used by `==` on float metrics.
pub const EQ_TOLERANCE: f64 = 0.1;

impl Comparison {
    pub fn holds(&self, actual: f64, threshold: f64) -> bool {
        match self {
            Comparison::Gt => actual > threshold,
            Comparison::Ge => actual >= threshold,
            Comparison::Lt => actual < threshold,
            Comparison::Le => actual <= threshold,
            Comparison::Eq => (actual - threshold).abs() < EQ_TOLERANCE,
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Comparison::Gt => ">",
            Comparison::Ge => ">=",
            Comparison::Lt => "<",
            Comparison::Le => "<=",
            Comparison::Eq => "==",
        };
        f.write_str(op)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    AddTask { task: Task },
    RemoveTask { task_id: TaskId },
    ChangePriority { task_id: TaskId, priority: u32 },
    /// Replace the task with the same id.
    ModifyTask { task: Task },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_trigger_rules() {
        let doc = json!({
            "rules": [
                {
                    "id": "night-shift",
                    "condition": {"type": "time_based", "hour_range": [22, 6]},
                    "action": {"type": "change_priority", "task_id": "video", "priority": 2}
                },
                {
                    "id": "scale-down",
                    "quorum": {"min_nodes_alive": 3},
                    "condition": {"type": "swarm_metric_agg", "metric": "cpu_percent",
                                  "aggregate": "average", "operator": ">", "threshold": 80.0},
                    "action": {"type": "remove_task", "task_id": "audio"}
                }
            ]
        });
        let set: TriggerSet = serde_json::from_value(doc).unwrap();
        assert_eq!(set.rules.len(), 2);
        assert!(set.rules[0].enabled);
        assert_eq!(
            set.rules[0].condition,
            Condition::TimeBased {
                hour_range: Some((22, 6)),
                weekdays: None
            }
        );
        assert_eq!(set.rules[1].quorum.as_ref().unwrap().min_nodes_alive, 3);
        match &set.rules[1].condition {
            Condition::SwarmMetric { operator, .. } => assert_eq!(*operator, Comparison::Gt),
            other => panic!("unexpected condition {:?}", other),
        }
    }

    #[test]
    fn test_comparison_equality_tolerance() {
        assert!(Comparison::Eq.holds(50.05, 50.0));
        assert!(!Comparison::Eq.holds(50.2, 50.0));
        assert!(Comparison::Ge.holds(50.0, 50.0));
        assert!(!Comparison::Gt.holds(50.0, 50.0));
    }
}
