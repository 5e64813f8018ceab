//! Governor: trigger-driven schedule mutation
//!
//! Each pass evaluates every trigger against a snapshot of the swarm,
//! applies the actions of those that fire, runs the sharding pass and
//! publishes the resulting schedule with one CAS. Passes that change
//! nothing publish nothing.

use crate::common::{Clock, Result, RetryPolicy};
use crate::coordination::{GeographicRouter, WritePlan};
use crate::model::{Assignments, OperationClass, Roster, Schedule, TaskId, TriggerSet};
use crate::ops::sharding::apply_sharding;
use crate::ops::triggers::{evaluate_trigger, EvalContext, TriggerEvaluation, TriggerStatus};
use crate::store::{read_document, CoordinationStore, Version, WriteBatch};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

/// Result of planning one pass, before anything is written.
#[derive(Debug, Clone, PartialEq)]
pub struct GovernorPlan {
    pub schedule: Schedule,
    pub evaluations: Vec<TriggerEvaluation>,
    pub applied: Vec<String>,
    pub sharded: Vec<TaskId>,
    pub alive_nodes: usize,
}

impl GovernorPlan {
    pub fn changes(&self, current: &Schedule) -> bool {
        !self.schedule.same_tasks(current)
    }

    pub fn description(&self) -> String {
        match (self.applied.is_empty(), self.sharded.is_empty()) {
            (false, true) => {
                format!("chore(governor): Applied triggers: {}", self.applied.join(", "))
            }
            (true, false) => format!("chore(governor): Sharded tasks: {}", self.sharded.join(", ")),
            _ => format!(
                "chore(governor): Applied triggers: {}; sharded {}",
                self.applied.join(", "),
                self.sharded.join(", ")
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum GovernorOutcome {
    Published { version: u64 },
    NoChange,
    /// Schedule changes need more live nodes than the swarm has.
    Deferred { needed: usize, alive: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct GovernorReport {
    pub evaluations: Vec<TriggerEvaluation>,
    pub applied: Vec<String>,
    pub sharded: Vec<TaskId>,
    pub outcome: GovernorOutcome,
}

impl GovernorReport {
    pub fn quorum_unmet(&self) -> impl Iterator<Item = &str> {
        self.evaluations
            .iter()
            .filter(|e| matches!(e.status, TriggerStatus::QuorumUnmet { .. }))
            .map(|e| e.trigger_id.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct Governor {
    node_timeout: Duration,
    router: Arc<GeographicRouter>,
}

impl Governor {
    pub fn new(node_timeout: Duration, router: Arc<GeographicRouter>) -> Self {
        Self {
            node_timeout,
            router,
        }
    }

    pub fn plan(
        &self,
        schedule: &Schedule,
        triggers: &TriggerSet,
        roster: &Roster,
        assignments: &Assignments,
        now: DateTime<Utc>,
    ) -> GovernorPlan {
        let ctx = EvalContext {
            now,
            alive_nodes: roster.alive(now, self.node_timeout).collect(),
            total_nodes: roster.len(),
            schedule,
            assignments,
        };

        let mut next = schedule.clone();
        let evaluations: Vec<TriggerEvaluation> = triggers
            .rules
            .iter()
            .map(|rule| evaluate_trigger(rule, &ctx, &mut next))
            .collect();
        let applied = evaluations
            .iter()
            .filter(|e| e.status == TriggerStatus::Applied)
            .map(|e| e.trigger_id.clone())
            .collect();
        let sharded = apply_sharding(&mut next);

        GovernorPlan {
            schedule: next,
            evaluations,
            applied,
            sharded,
            alive_nodes: ctx.alive_nodes.len(),
        }
    }

    /// Plan against the current store contents without writing.
    pub async fn preview(
        &self,
        store: &dyn CoordinationStore,
        clock: &dyn Clock,
    ) -> Result<GovernorPlan> {
        let (schedule, triggers, roster, assignments) = read_inputs(store).await?;
        Ok(self.plan(&schedule.0, &triggers, &roster, &assignments, clock.now()))
    }

    pub async fn run(
        &self,
        store: &dyn CoordinationStore,
        policy: &RetryPolicy,
        clock: &dyn Clock,
    ) -> Result<GovernorReport> {
        policy
            .run("governor pass", || self.run_once(store, clock))
            .await
    }

    async fn run_once(
        &self,
        store: &dyn CoordinationStore,
        clock: &dyn Clock,
    ) -> Result<GovernorReport> {
        let ((current, version), triggers, roster, assignments) = read_inputs(store).await?;
        let plan = self.plan(&current, &triggers, &roster, &assignments, clock.now());

        let mut report = GovernorReport {
            evaluations: plan.evaluations.clone(),
            applied: plan.applied.clone(),
            sharded: plan.sharded.clone(),
            outcome: GovernorOutcome::NoChange,
        };
        if !plan.changes(&current) {
            tracing::debug!("Governor pass made no changes");
            return Ok(report);
        }

        if let WritePlan::Deferred { needed, alive } =
            self.router.plan_write(OperationClass::ScheduleChanges, plan.alive_nodes)
        {
            tracing::warn!(
                "Schedule change deferred: {} live node(s), strong consistency needs {}",
                alive,
                needed
            );
            report.outcome = GovernorOutcome::Deferred { needed, alive };
            return Ok(report);
        }

        let description = plan.description();
        let mut next = plan.schedule;
        next.version = current.version + 1;
        let mut batch = WriteBatch::new();
        batch.stage_document(&next, version, description.clone())?;
        store.publish(batch).await?;

        tracing::info!("{} (schedule version {})", description, next.version);
        report.outcome = GovernorOutcome::Published {
            version: next.version,
        };
        Ok(report)
    }
}

async fn read_inputs(
    store: &dyn CoordinationStore,
) -> Result<((Schedule, Version), TriggerSet, Roster, Assignments)> {
    let schedule = read_document::<Schedule>(store).await?;
    let triggers = read_document::<TriggerSet>(store).await?;
    let roster = read_document::<Roster>(store).await?;
    let assignments = read_document::<Assignments>(store).await?;
    Ok((
        (schedule.value, schedule.version),
        triggers.value,
        roster.value,
        assignments.value,
    ))
}
