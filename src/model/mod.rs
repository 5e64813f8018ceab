//! Shared documents of the swarm
//!
//! Every document is a pretty-printed JSON file in the coordination
//! repository. Each type implements [`crate::store::Document`], which ties it
//! to its file.

pub mod assignment;
pub mod content;
pub mod node;
pub mod region;
pub mod task;
pub mod trigger;

pub use assignment::{Assignment, Assignments};
pub use content::ContentList;
pub use node::{Node, NodeId, NodeMetrics, Roster};
pub use region::{ConsistencyPolicy, OperationClass, RegionInfo, RegionalPolicy};
pub use task::{Schedule, ShardingConfig, Task, TaskId, TaskKind};
pub use trigger::{
    Action, Comparison, Condition, MetricAggregate, Quorum, TaskAggregate, Trigger, TriggerSet,
};
