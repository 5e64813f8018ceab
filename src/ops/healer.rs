//! Healer: roster eviction and orphaned assignment cleanup
//!
//! A pass reads the roster and the assignments, computes the corrections
//! and publishes them as one batch. A consistent swarm produces no write.

use crate::common::{short_id, Clock, Result, RetryPolicy};
use crate::model::{Assignments, NodeId, Roster, TaskId};
use crate::store::{read_document, CoordinationStore, WriteBatch};
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClearReason {
    /// Owner is not in the roster at all.
    OwnerMissing,
    /// Owner stopped heartbeating.
    OwnerStale,
    LeaseExpired,
}

impl fmt::Display for ClearReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ClearReason::OwnerMissing => "owner missing",
            ClearReason::OwnerStale => "owner stale",
            ClearReason::LeaseExpired => "lease expired",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearedAssignment {
    pub task_id: TaskId,
    pub node_id: NodeId,
    pub reason: ClearReason,
}

/// Corrections for one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealPlan {
    pub evicted_nodes: Vec<NodeId>,
    pub cleared: Vec<ClearedAssignment>,
}

impl HealPlan {
    pub fn is_empty(&self) -> bool {
        self.evicted_nodes.is_empty() && self.cleared.is_empty()
    }

    /// Zombies: assignments whose owner is gone or stale.
    pub fn zombie_count(&self) -> usize {
        self.cleared
            .iter()
            .filter(|c| c.reason != ClearReason::LeaseExpired)
            .count()
    }

    pub fn expired_count(&self) -> usize {
        self.cleared.len() - self.zombie_count()
    }

    pub fn apply(&self, roster: &mut Roster, assignments: &mut Assignments) {
        for id in &self.evicted_nodes {
            roster.remove(id);
        }
        for cleared in &self.cleared {
            assignments.release(&cleared.task_id, &cleared.node_id);
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealReport {
    pub nodes_evicted: usize,
    pub assignments_cleared: usize,
    pub published: bool,
}

#[derive(Debug, Clone)]
pub struct Healer {
    node_timeout: Duration,
}

impl Healer {
    pub fn new(node_timeout: Duration) -> Self {
        Self { node_timeout }
    }

    pub fn node_timeout(&self) -> Duration {
        self.node_timeout
    }

    /// Pure planning step.
    pub fn plan(&self, roster: &Roster, assignments: &Assignments, now: DateTime<Utc>) -> HealPlan {
        let evicted_nodes = roster.stale_ids(now, self.node_timeout);
        let cleared = assignments
            .assignments
            .values()
            .filter_map(|a| {
                let reason = match roster.get(&a.node_id) {
                    None => ClearReason::OwnerMissing,
                    Some(owner) if !owner.is_alive(now, self.node_timeout) => {
                        ClearReason::OwnerStale
                    }
                    Some(_) if !a.is_live(now) => ClearReason::LeaseExpired,
                    Some(_) => return None,
                };
                Some(ClearedAssignment {
                    task_id: a.task_id.clone(),
                    node_id: a.node_id.clone(),
                    reason,
                })
            })
            .collect();
        HealPlan {
            evicted_nodes,
            cleared,
        }
    }

    /// Read the current state and plan without writing anything.
    pub async fn preview(
        &self,
        store: &dyn CoordinationStore,
        clock: &dyn Clock,
    ) -> Result<HealPlan> {
        let roster = read_document::<Roster>(store).await?;
        let assignments = read_document::<Assignments>(store).await?;
        Ok(self.plan(&roster.value, &assignments.value, clock.now()))
    }

    /// One healing pass, retried on conflicts per `policy`.
    pub async fn run(
        &self,
        store: &dyn CoordinationStore,
        policy: &RetryPolicy,
        clock: &dyn Clock,
    ) -> Result<HealReport> {
        policy
            .run("healer pass", || self.run_once(store, clock))
            .await
    }

    async fn run_once(
        &self,
        store: &dyn CoordinationStore,
        clock: &dyn Clock,
    ) -> Result<HealReport> {
        let roster = read_document::<Roster>(store).await?;
        let assignments = read_document::<Assignments>(store).await?;
        let plan = self.plan(&roster.value, &assignments.value, clock.now());
        if plan.is_empty() {
            tracing::debug!("Healer found nothing to fix");
            return Ok(HealReport::default());
        }

        let (mut next_roster, mut next_assignments) = (roster.value, assignments.value);
        plan.apply(&mut next_roster, &mut next_assignments);

        let mut batch = WriteBatch::new();
        if !plan.evicted_nodes.is_empty() {
            let ids: Vec<&str> = plan.evicted_nodes.iter().map(|id| short_id(id)).collect();
            batch.stage_document(
                &next_roster,
                roster.version,
                format!("fix(healer): Evicted stale nodes {}", ids.join(", ")),
            )?;
        }
        if !plan.cleared.is_empty() {
            batch.stage_document(
                &next_assignments,
                assignments.version,
                format!(
                    "fix(healer): Cleared {} zombie and {} stale task assignments",
                    plan.zombie_count(),
                    plan.expired_count()
                ),
            )?;
        }
        store.publish(batch).await?;

        for cleared in &plan.cleared {
            tracing::info!(
                "Healer cleared {} from node {} ({})",
                cleared.task_id,
                short_id(&cleared.node_id),
                cleared.reason
            );
        }
        if !plan.evicted_nodes.is_empty() {
            tracing::info!("Healer evicted {} stale node(s)", plan.evicted_nodes.len());
        }
        Ok(HealReport {
            nodes_evicted: plan.evicted_nodes.len(),
            assignments_cleared: plan.cleared.len(),
            published: true,
        })
    }
}
