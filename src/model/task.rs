//! Tasks and the schedule document

use crate::coordination::roles::Role;
use crate::store::{Document, DocumentKey};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub type TaskId = String;

/// Reserved priorities. Lower numbers are claimed first.
pub const HEALER_PRIORITY: u32 = 0;
pub const GOVERNOR_PRIORITY: u32 = 1;
pub const MIN_WORK_PRIORITY: u32 = 2;

pub const HEALER_TASK_ID: &str = "healer";
pub const GOVERNOR_TASK_ID: &str = "governor";

/// What a task does. Serialized inline with the task under a `type` tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    Healer {
        #[serde(default = "default_healer_interval")]
        interval_secs: u64,
    },
    Governor {
        #[serde(default = "default_governor_interval")]
        interval_secs: u64,
    },
    /// Runs an external worker through the launcher registered for `renderer`.
    Renderer {
        renderer: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        items: Vec<Value>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        params: Map<String, Value>,
    },
    Shard {
        parent_id: TaskId,
        renderer: String,
        index: usize,
        total: usize,
        start: usize,
        end: usize,
        #[serde(default)]
        items: Vec<Value>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        params: Map<String, Value>,
    },
    Combiner {
        parent_id: TaskId,
        renderer: String,
        shard_ids: Vec<TaskId>,
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        params: Map<String, Value>,
    },
}

fn default_healer_interval() -> u64 {
    60
}

fn default_governor_interval() -> u64 {
    300
}

/// Per-task sharding parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShardingConfig {
    pub enabled: bool,
    pub items_per_shard: usize,
    pub min_items_for_sharding: usize,
    pub max_shards: usize,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            items_per_shard: 10,
            min_items_for_sharding: 20,
            max_shards: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(flatten)]
    pub kind: TaskKind,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharding: Option<ShardingConfig>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<TaskId>,
}

fn default_priority() -> u32 {
    MIN_WORK_PRIORITY
}

impl Task {
    pub fn healer(interval_secs: u64) -> Self {
        Self::system(HEALER_TASK_ID, TaskKind::Healer { interval_secs }, HEALER_PRIORITY)
    }

    pub fn governor(interval_secs: u64) -> Self {
        Self::system(
            GOVERNOR_TASK_ID,
            TaskKind::Governor { interval_secs },
            GOVERNOR_PRIORITY,
        )
    }

    fn system(id: &str, kind: TaskKind, priority: u32) -> Self {
        Self {
            id: id.to_string(),
            kind,
            priority,
            required_role: Some(Role::System),
            required_region: None,
            sharding: None,
            depends_on: Vec::new(),
        }
    }

    pub fn renderer(id: impl Into<TaskId>, renderer: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            kind: TaskKind::Renderer {
                renderer: renderer.into(),
                items: Vec::new(),
                params: Map::new(),
            },
            priority,
            required_role: None,
            required_region: None,
            sharding: None,
            depends_on: Vec::new(),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.required_role = Some(role);
        self
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.required_region = Some(region.into());
        self
    }

    pub fn with_items(mut self, new_items: Vec<Value>) -> Self {
        if let TaskKind::Renderer { items, .. } | TaskKind::Shard { items, .. } = &mut self.kind {
            *items = new_items;
        }
        self
    }

    pub fn with_sharding(mut self, sharding: ShardingConfig) -> Self {
        self.sharding = Some(sharding);
        self
    }

    /// Healer and Governor run inside the node instead of an external worker.
    pub fn is_privileged(&self) -> bool {
        matches!(self.kind, TaskKind::Healer { .. } | TaskKind::Governor { .. })
    }

    /// Launcher name for tasks backed by an external worker.
    pub fn renderer_name(&self) -> Option<&str> {
        match &self.kind {
            TaskKind::Renderer { renderer, .. }
            | TaskKind::Shard { renderer, .. }
            | TaskKind::Combiner { renderer, .. } => Some(renderer),
            TaskKind::Healer { .. } | TaskKind::Governor { .. } => None,
        }
    }

    pub fn items(&self) -> &[Value] {
        match &self.kind {
            TaskKind::Renderer { items, .. } | TaskKind::Shard { items, .. } => items,
            _ => &[],
        }
    }

    /// Parent id for shards and combiners.
    pub fn parent_id(&self) -> Option<&str> {
        match &self.kind {
            TaskKind::Shard { parent_id, .. } | TaskKind::Combiner { parent_id, .. } => {
                Some(parent_id)
            }
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self.kind {
            TaskKind::Healer { .. } => "healer",
            TaskKind::Governor { .. } => "governor",
            TaskKind::Renderer { .. } => "renderer",
            TaskKind::Shard { .. } => "shard",
            TaskKind::Combiner { .. } => "combiner",
        }
    }

    /// Claim order: priority, then id.
    pub fn claim_order(&self) -> (u32, &str) {
        (self.priority, self.id.as_str())
    }
}

/// `schedule.json`: the task list all nodes claim from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    /// Bumped on every accepted Governor mutation.
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Document for Schedule {
    const KEY: DocumentKey = DocumentKey::Schedule;
}

impl Schedule {
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    /// True when the task itself or any shard/combiner derived from it exists.
    pub fn contains_or_sharded(&self, id: &str) -> bool {
        self.tasks
            .iter()
            .any(|t| t.id == id || t.parent_id() == Some(id))
    }

    /// Tasks in claim order.
    pub fn ordered(&self) -> Vec<&Task> {
        let mut tasks: Vec<&Task> = self.tasks.iter().collect();
        tasks.sort_by(|a, b| a.claim_order().cmp(&b.claim_order()));
        tasks
    }

    /// Remove a task by id. Returns whether anything was removed.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.tasks.len();
        self.tasks.retain(|t| t.id != id);
        self.tasks.len() != before
    }

    /// Same task list, ignoring the version counter.
    pub fn same_tasks(&self, other: &Schedule) -> bool {
        self.tasks == other.tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_kind_is_tagged_inline() {
        let task = Task::renderer("news", "text", 3).with_items(vec![json!("a"), json!("b")]);
        let value = serde_json::to_value(&task).unwrap();
        assert_eq!(value["type"], "renderer");
        assert_eq!(value["renderer"], "text");
        assert_eq!(value["items"], json!(["a", "b"]));

        let back: Task = serde_json::from_value(value).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_parse_minimal_task_uses_defaults() {
        let task: Task =
            serde_json::from_value(json!({"id": "healer", "type": "healer"})).unwrap();
        assert_eq!(task.kind, TaskKind::Healer { interval_secs: 60 });
        assert_eq!(task.priority, MIN_WORK_PRIORITY);
        assert!(task.is_privileged());
    }

    #[test]
    fn test_reserved_tasks() {
        let healer = Task::healer(60);
        let governor = Task::governor(300);
        assert_eq!(healer.priority, HEALER_PRIORITY);
        assert_eq!(governor.priority, GOVERNOR_PRIORITY);
        assert_eq!(healer.required_role, Some(Role::System));
        assert!(healer.renderer_name().is_none());
    }

    #[test]
    fn test_ordered_by_priority_then_id() {
        let schedule = Schedule {
            version: 1,
            tasks: vec![
                Task::renderer("b", "text", 2),
                Task::governor(300),
                Task::renderer("a", "text", 2),
                Task::healer(60),
            ],
        };
        let ids: Vec<&str> = schedule.ordered().iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["healer", "governor", "a", "b"]);
    }

    #[test]
    fn test_contains_or_sharded() {
        let schedule = Schedule {
            version: 0,
            tasks: vec![Task {
                id: "video-shard-1".into(),
                kind: TaskKind::Shard {
                    parent_id: "video".into(),
                    renderer: "video".into(),
                    index: 0,
                    total: 2,
                    start: 0,
                    end: 5,
                    items: vec![],
                    params: Map::new(),
                },
                priority: 2,
                required_role: None,
                required_region: None,
                sharding: None,
                depends_on: vec![],
            }],
        };
        assert!(schedule.contains_or_sharded("video"));
        assert!(!schedule.contains("video"));
        assert!(!schedule.contains_or_sharded("audio"));
    }
}
