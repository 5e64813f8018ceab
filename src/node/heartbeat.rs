//! Roster heartbeats
//!
//! Each node periodically upserts its own roster entry with a fresh
//! `last_heartbeat`, host metrics and the task it is working on. Liveness
//! everywhere else in the swarm is derived from these timestamps.

use crate::common::{short_id, Clock};
use crate::model::{Node, NodeMetrics, Roster, TaskId};
use crate::node::runtime::NodeContext;
use crate::store::Mutation;
use sysinfo::System;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Samples CPU and memory usage of the host.
pub struct HostMetrics {
    system: System,
}

impl Default for HostMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl HostMetrics {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    pub fn sample(&mut self) -> NodeMetrics {
        self.system.refresh_cpu();
        self.system.refresh_memory();
        let total = self.system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            self.system.used_memory() as f64 / total as f64 * 100.0
        };
        NodeMetrics {
            cpu_percent: f64::from(self.system.global_cpu_info().cpu_usage()),
            memory_percent,
            gauges: Default::default(),
        }
    }
}

/// Mutation that upserts this node's roster entry.
pub fn upsert_self(
    ctx: &NodeContext,
    metrics: NodeMetrics,
    current_task: Option<TaskId>,
) -> impl FnMut(&mut Roster) -> Mutation + Send + 'static {
    let identity = ctx.identity.clone();
    let clock = ctx.clock.clone();
    move |roster: &mut Roster| {
        let now = clock.now();
        let mut node = roster
            .get(&identity.id)
            .cloned()
            .unwrap_or_else(|| {
                Node::new(
                    identity.id.clone(),
                    identity.region.clone(),
                    identity.roles.clone(),
                    identity.started_at,
                )
            });
        node.region = identity.region.clone();
        node.roles = identity.roles.clone();
        node.started_at = identity.started_at;
        node.last_heartbeat = now;
        node.metrics = metrics.clone();
        node.current_task = current_task.clone();
        roster.upsert(node);
        Mutation::Changed(format!(
            "chore(roster): heartbeat from node {}",
            short_id(&identity.id)
        ))
    }
}

/// Publish one heartbeat through the node's writer.
pub async fn send_heartbeat(
    ctx: &NodeContext,
    metrics: NodeMetrics,
    current_task: Option<TaskId>,
) -> crate::Result<()> {
    ctx.writer
        .mutate::<Roster, _>(upsert_self(ctx, metrics, current_task))
        .await?;
    tracing::debug!("Heartbeat sent for node {}", short_id(&ctx.identity.id));
    Ok(())
}

/// Heartbeat loop: one write per interval until shutdown. The current task
/// is read from `current`, which the state machine keeps up to date.
pub fn spawn_heartbeat(
    ctx: NodeContext,
    current: watch::Receiver<Option<TaskId>>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut host = HostMetrics::new();
        let interval = ctx.config.node_heartbeat_interval();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            let task = current.borrow().clone();
            if let Err(e) = send_heartbeat(&ctx, host.sample(), task).await {
                tracing::warn!("Heartbeat failed: {}", e);
            }
        }
        tracing::debug!("Heartbeat loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_metrics_are_percentages() {
        let mut host = HostMetrics::new();
        let metrics = host.sample();
        assert!((0.0..=100.0).contains(&metrics.memory_percent));
        assert!(metrics.cpu_percent >= 0.0);
    }
}
