//! Privileged swarm passes: healing and governance
//!
//! The node holding the `healer` lease runs [`Healer`] passes, the node
//! holding `governor` runs [`Governor`] passes. Operators can run either
//! one-shot from the CLI.

pub mod governor;
pub mod healer;
pub mod sharding;
pub mod triggers;

pub use governor::{Governor, GovernorOutcome, GovernorPlan, GovernorReport};
pub use healer::{ClearReason, ClearedAssignment, HealPlan, HealReport, Healer};
pub use sharding::{apply_sharding, plan_shards, split_task, ShardRange};
pub use triggers::{evaluate_trigger, EvalContext, TriggerEvaluation, TriggerStatus};
