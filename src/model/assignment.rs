//! Leases held by nodes on tasks

use crate::model::{NodeId, TaskId};
use crate::store::{Document, DocumentKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: TaskId,
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    pub claimed_at: DateTime<Utc>,
    pub lease_expires_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Assignment {
    /// The lease is live while `now` has not passed its expiry.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        now <= self.lease_expires_at
    }

    pub fn is_owned_by(&self, node_id: &str) -> bool {
        self.node_id == node_id
    }
}

/// `assignments.json`: keyed by task id, so a task has at most one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignments {
    #[serde(default)]
    pub assignments: BTreeMap<TaskId, Assignment>,
}

impl Document for Assignments {
    const KEY: DocumentKey = DocumentKey::Assignments;
}

impl Assignments {
    pub fn get(&self, task_id: &str) -> Option<&Assignment> {
        self.assignments.get(task_id)
    }

    pub fn insert(&mut self, assignment: Assignment) {
        self.assignments
            .insert(assignment.task_id.clone(), assignment);
    }

    pub fn remove(&mut self, task_id: &str) -> Option<Assignment> {
        self.assignments.remove(task_id)
    }

    /// Remove the entry only if `node_id` still holds it.
    pub fn release(&mut self, task_id: &str, node_id: &str) -> bool {
        if self
            .assignments
            .get(task_id)
            .is_some_and(|a| a.is_owned_by(node_id))
        {
            self.assignments.remove(task_id);
            true
        } else {
            false
        }
    }

    pub fn live(&self, task_id: &str, now: DateTime<Utc>) -> Option<&Assignment> {
        self.get(task_id).filter(|a| a.is_live(now))
    }

    pub fn owned_by<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Assignment> + 'a {
        self.assignments
            .values()
            .filter(move |a| a.is_owned_by(node_id))
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }
}
