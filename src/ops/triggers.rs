//! Trigger evaluation: quorum gates, conditions and schedule actions
//!
//! Everything here is pure. The Governor feeds it a snapshot of the swarm
//! and applies the returned schedule.

use crate::model::{
    Action, Assignments, Condition, MetricAggregate, Node, Quorum, Schedule, Task, TaskAggregate,
    Trigger,
};
use crate::ops::sharding::split_task;
use chrono::{DateTime, Datelike, Timelike, Utc};

/// Swarm snapshot a trigger is evaluated against.
#[derive(Debug, Clone)]
pub struct EvalContext<'a> {
    pub now: DateTime<Utc>,
    pub alive_nodes: Vec<&'a Node>,
    pub total_nodes: usize,
    pub schedule: &'a Schedule,
    pub assignments: &'a Assignments,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TriggerStatus {
    Disabled,
    /// Skipped without evaluating the condition.
    QuorumUnmet { alive: usize, total: usize },
    ConditionFalse,
    Applied,
    /// Condition held but the schedule already reflects the action.
    AlreadyApplied,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TriggerEvaluation {
    pub trigger_id: String,
    pub status: TriggerStatus,
}

pub fn quorum_met(quorum: &Quorum, alive: usize, total: usize) -> bool {
    if alive < quorum.min_nodes_alive {
        return false;
    }
    if quorum.min_percent_alive <= 0.0 {
        return true;
    }
    if total == 0 {
        return false;
    }
    (alive as f64 / total as f64) * 100.0 >= quorum.min_percent_alive
}

pub fn evaluate_condition(condition: &Condition, ctx: &EvalContext<'_>) -> bool {
    match condition {
        Condition::TimeBased {
            hour_range,
            weekdays,
        } => {
            let hour_ok = hour_range.map_or(true, |(start, end)| {
                in_hour_range(ctx.now.hour(), start, end)
            });
            let day_ok = weekdays.as_ref().map_or(true, |days| {
                days.contains(&ctx.now.weekday().num_days_from_monday())
            });
            hour_ok && day_ok
        }
        Condition::SwarmMetric {
            metric,
            aggregate,
            operator,
            threshold,
        } => {
            let values: Vec<f64> = ctx
                .alive_nodes
                .iter()
                .filter_map(|n| n.metrics.get(metric))
                .collect();
            match aggregate_metric(&values, *aggregate) {
                Some(actual) => operator.holds(actual, *threshold),
                None => false,
            }
        }
        Condition::TaskMetric {
            aggregate,
            operator,
            threshold,
        } => {
            let actual = task_metric(ctx, *aggregate) as f64;
            operator.holds(actual, *threshold)
        }
    }
}

/// Inclusive hour window; `start > end` wraps past midnight.
pub fn in_hour_range(hour: u32, start: u32, end: u32) -> bool {
    if start <= end {
        (start..=end).contains(&hour)
    } else {
        hour >= start || hour <= end
    }
}

/// `None` when there is nothing to aggregate (count is always defined).
pub fn aggregate_metric(values: &[f64], aggregate: MetricAggregate) -> Option<f64> {
    if values.is_empty() {
        return match aggregate {
            MetricAggregate::Count => Some(0.0),
            _ => None,
        };
    }
    let sum: f64 = values.iter().sum();
    let result = match aggregate {
        MetricAggregate::Average => sum / values.len() as f64,
        MetricAggregate::Sum => sum,
        MetricAggregate::Count => values.len() as f64,
        MetricAggregate::Max => values.iter().copied().fold(f64::MIN, f64::max),
        MetricAggregate::Min => values.iter().copied().fold(f64::MAX, f64::min),
    };
    Some(result)
}

fn task_metric(ctx: &EvalContext<'_>, aggregate: TaskAggregate) -> usize {
    let total = ctx.schedule.tasks.len();
    let assigned = ctx
        .schedule
        .tasks
        .iter()
        .filter(|t| ctx.assignments.live(&t.id, ctx.now).is_some())
        .count();
    match aggregate {
        TaskAggregate::Total => total,
        TaskAggregate::Assigned => assigned,
        TaskAggregate::Unassigned => total - assigned,
    }
}

/// Apply an action to the schedule. Returns whether anything changed.
///
/// Actions address a task by id; for a task that was split into shards the
/// id refers to the whole family (shards plus combiner).
pub fn apply_action(schedule: &mut Schedule, action: &Action) -> bool {
    match action {
        Action::AddTask { task } => {
            if schedule.contains_or_sharded(&task.id) {
                return false;
            }
            schedule.tasks.push(task.clone());
            true
        }
        Action::RemoveTask { task_id } => {
            let before = schedule.tasks.len();
            schedule
                .tasks
                .retain(|t| t.id != *task_id && t.parent_id() != Some(task_id.as_str()));
            schedule.tasks.len() != before
        }
        Action::ChangePriority { task_id, priority } => {
            let mut changed = false;
            for task in schedule.tasks.iter_mut() {
                let wanted = if task.id == *task_id {
                    *priority
                } else if task.parent_id() == Some(task_id.as_str()) {
                    match task.kind {
                        crate::model::TaskKind::Combiner { .. } => priority.saturating_add(1),
                        _ => *priority,
                    }
                } else {
                    continue;
                };
                if task.priority != wanted {
                    task.priority = wanted;
                    changed = true;
                }
            }
            changed
        }
        Action::ModifyTask { task } => {
            if let Some(existing) = schedule.get_mut(&task.id) {
                if existing == task {
                    return false;
                }
                *existing = task.clone();
                return true;
            }
            // sharded family: put the parent back where its first shard was,
            // the sharding pass splits it again with the new definition
            let family: Vec<&Task> = schedule
                .tasks
                .iter()
                .filter(|t| t.parent_id() == Some(task.id.as_str()))
                .collect();
            if family.is_empty() {
                return false;
            }
            if let Some(resplit) = split_task(task) {
                if resplit.iter().eq(family.iter().copied()) {
                    return false;
                }
            }
            let Some(pos) = schedule
                .tasks
                .iter()
                .position(|t| t.parent_id() == Some(task.id.as_str()))
            else {
                return false;
            };
            schedule
                .tasks
                .retain(|t| t.parent_id() != Some(task.id.as_str()));
            schedule.tasks.insert(pos.min(schedule.tasks.len()), task.clone());
            true
        }
    }
}

/// Quorum gate, then condition, then action.
pub fn evaluate_trigger(
    trigger: &Trigger,
    ctx: &EvalContext<'_>,
    schedule: &mut Schedule,
) -> TriggerEvaluation {
    let status = if !trigger.enabled {
        TriggerStatus::Disabled
    } else if let Some(quorum) = trigger
        .quorum
        .as_ref()
        .filter(|q| !quorum_met(q, ctx.alive_nodes.len(), ctx.total_nodes))
    {
        tracing::info!(
            "Trigger {} skipped: quorum unmet ({} of {} alive, need {} / {}%)",
            trigger.id,
            ctx.alive_nodes.len(),
            ctx.total_nodes,
            quorum.min_nodes_alive,
            quorum.min_percent_alive
        );
        TriggerStatus::QuorumUnmet {
            alive: ctx.alive_nodes.len(),
            total: ctx.total_nodes,
        }
    } else if !evaluate_condition(&trigger.condition, ctx) {
        TriggerStatus::ConditionFalse
    } else if apply_action(schedule, &trigger.action) {
        tracing::info!("Applied trigger {}", trigger.id);
        TriggerStatus::Applied
    } else {
        tracing::debug!("Trigger {} condition met, action already applied", trigger.id);
        TriggerStatus::AlreadyApplied
    };
    TriggerEvaluation {
        trigger_id: trigger.id.clone(),
        status,
    }
}
