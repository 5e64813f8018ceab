//! Splitting large renderer tasks into shards plus a combiner
//!
//! A renderer task with sharding enabled and more than
//! `min_items_for_sharding` items is replaced by N shard tasks over
//! contiguous item ranges and one combiner that depends on all of them.
//!
//! ```text
//!   video (23 items, 5 per shard, max 4)
//!     ├── video-shard-1  [0, 5)
//!     ├── video-shard-2  [5, 10)
//!     ├── video-shard-3  [10, 15)
//!     ├── video-shard-4  [15, 23)   last shard takes the remainder
//!     └── video-combiner            depends on all four
//! ```

use crate::model::{Schedule, ShardingConfig, Task, TaskId, TaskKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRange {
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

impl ShardRange {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

pub fn shard_id(parent: &str, index: usize) -> TaskId {
    format!("{}-shard-{}", parent, index + 1)
}

pub fn combiner_id(parent: &str) -> TaskId {
    format!("{}-combiner", parent)
}

/// Number of shards for `items` items; 1 means "do not shard".
pub fn shard_count(items: usize, config: &ShardingConfig) -> usize {
    if !config.enabled || items <= config.min_items_for_sharding {
        return 1;
    }
    let per = config.items_per_shard.max(1);
    items.div_ceil(per).min(config.max_shards).max(1)
}

/// Contiguous ranges covering `0..items`. Empty when no sharding applies.
pub fn plan_shards(items: usize, config: &ShardingConfig) -> Vec<ShardRange> {
    let n = shard_count(items, config);
    if n < 2 {
        return Vec::new();
    }
    let per = config.items_per_shard.max(1);
    let ranges: Vec<ShardRange> = (0..n)
        .map(|index| ShardRange {
            index,
            start: index * per,
            end: if index == n - 1 { items } else { (index + 1) * per },
        })
        .collect();

    let largest = ranges.iter().map(ShardRange::len).max().unwrap_or(0);
    if largest > 2 * per {
        tracing::warn!(
            "ShardImbalance: largest shard has {} items, target is {} (max_shards {} reached)",
            largest,
            per,
            config.max_shards
        );
    }
    ranges
}

/// Shard and combiner tasks replacing `parent`, or `None` if it stays whole.
pub fn split_task(parent: &Task) -> Option<Vec<Task>> {
    let TaskKind::Renderer {
        renderer,
        items,
        params,
    } = &parent.kind
    else {
        return None;
    };
    let config = parent.sharding.as_ref()?;
    let ranges = plan_shards(items.len(), config);
    if ranges.is_empty() {
        return None;
    }

    let total = ranges.len();
    let mut tasks: Vec<Task> = ranges
        .iter()
        .map(|range| Task {
            id: shard_id(&parent.id, range.index),
            kind: TaskKind::Shard {
                parent_id: parent.id.clone(),
                renderer: renderer.clone(),
                index: range.index,
                total,
                start: range.start,
                end: range.end,
                items: items[range.start..range.end].to_vec(),
                params: params.clone(),
            },
            priority: parent.priority,
            required_role: parent.required_role,
            required_region: parent.required_region.clone(),
            sharding: None,
            depends_on: parent.depends_on.clone(),
        })
        .collect();

    let shard_ids: Vec<TaskId> = tasks.iter().map(|t| t.id.clone()).collect();
    tasks.push(Task {
        id: combiner_id(&parent.id),
        kind: TaskKind::Combiner {
            parent_id: parent.id.clone(),
            renderer: renderer.clone(),
            shard_ids: shard_ids.clone(),
            params: params.clone(),
        },
        // after its shards in claim order
        priority: parent.priority.saturating_add(1),
        required_role: parent.required_role,
        required_region: parent.required_region.clone(),
        sharding: None,
        depends_on: shard_ids,
    });
    Some(tasks)
}

/// Replace every shardable task in place. Returns the ids of the tasks that
/// were split; an already-sharded schedule is left untouched.
pub fn apply_sharding(schedule: &mut Schedule) -> Vec<TaskId> {
    let mut split = Vec::new();
    let mut tasks = Vec::with_capacity(schedule.tasks.len());
    for task in schedule.tasks.drain(..) {
        match split_task(&task) {
            Some(derived) => {
                tracing::info!(
                    "Sharded task {} into {} shards",
                    task.id,
                    derived.len() - 1
                );
                split.push(task.id);
                tasks.extend(derived);
            }
            None => tasks.push(task),
        }
    }
    schedule.tasks = tasks;
    split
}
