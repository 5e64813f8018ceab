//! Node lifecycle: Idle -> AttemptClaim -> Active -> Idle
//!
//! ```text
//!            candidate found             claim published
//!   Idle ───────────────────► AttemptClaim ───────────────► Active
//!    ▲                              │                          │
//!    │      lost race / vanished    │   lease lost, worker     │
//!    └──────────────────────────────┴── unhealthy, task gone ──┘
//! ```
//!
//! Every transition goes through [`NodeStateMachine::apply`]; an event that
//! does not fit the current state leaves it untouched and returns
//! `InvalidStateTransition`.

use crate::common::{short_id, Clock, Error, Result};
use crate::coordination::{is_orphan, LeaseConfig};
use crate::model::{Assignment, Assignments, Schedule, Task, TaskId, TaskKind};
use crate::node::runtime::NodeContext;
use crate::node::worker::{HealthMonitor, Verdict, Worker};
use crate::ops::{Governor, Healer};
use crate::store::{read_document, Mutation, WriteOutcome};
use chrono::{DateTime, Utc};
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

pub enum LifecycleState {
    Idle,
    AttemptClaim { candidate: Task },
    Active(Box<ActiveWork>),
}

impl LifecycleState {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleState::Idle => "idle",
            LifecycleState::AttemptClaim { .. } => "attempt_claim",
            LifecycleState::Active(_) => "active",
        }
    }

    pub fn task_id(&self) -> Option<&str> {
        match self {
            LifecycleState::Idle => None,
            LifecycleState::AttemptClaim { candidate } => Some(&candidate.id),
            LifecycleState::Active(work) => Some(&work.task.id),
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self, LifecycleState::Active(_))
    }
}

/// A held task and whatever executes it.
pub struct ActiveWork {
    pub task: Task,
    pub lease: Assignment,
    runner: Runner,
}

enum Runner {
    External {
        worker: Box<dyn Worker>,
        monitor: HealthMonitor,
        next_probe: Instant,
    },
    /// Healer and Governor passes run on the node itself.
    Privileged { next_run: Instant },
}

enum Transition {
    BeginClaim(Task),
    Activate(Box<ActiveWork>),
    BackToIdle,
}

impl Transition {
    fn name(&self) -> &'static str {
        match self {
            Transition::BeginClaim(_) => "begin_claim",
            Transition::Activate(_) => "activate",
            Transition::BackToIdle => "back_to_idle",
        }
    }
}

enum ActiveStep {
    Continue(Duration),
    Release(String),
}

/// First claimable task in claim order: eligible for this node and either
/// unassigned, orphaned, or already held by `node_id`.
pub fn select_candidate<'a>(
    schedule: &'a Schedule,
    assignments: &Assignments,
    node_id: &str,
    now: DateTime<Utc>,
    mut eligible: impl FnMut(&Task) -> bool,
) -> Option<&'a Task> {
    schedule.ordered().into_iter().find(|task| {
        eligible(task)
            && assignments
                .get(&task.id)
                .map_or(true, |a| a.is_owned_by(node_id) || is_orphan(a, now))
    })
}

pub struct NodeStateMachine {
    ctx: NodeContext,
    state: LifecycleState,
    current: watch::Sender<Option<TaskId>>,
    degraded: bool,
    /// Duration of the last assignment write, in milliseconds.
    write_latency_ms: AtomicU64,
}

impl NodeStateMachine {
    pub fn new(ctx: NodeContext) -> Self {
        let (current, _) = watch::channel(None);
        Self {
            ctx,
            state: LifecycleState::Idle,
            current,
            degraded: false,
            write_latency_ms: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    /// Task this node works on, updated on every transition.
    pub fn current_task(&self) -> watch::Receiver<Option<TaskId>> {
        self.current.subscribe()
    }

    fn apply(&mut self, transition: Transition) -> Result<()> {
        let previous = std::mem::replace(&mut self.state, LifecycleState::Idle);
        let next = match (previous, transition) {
            (LifecycleState::Idle, Transition::BeginClaim(candidate)) => {
                LifecycleState::AttemptClaim { candidate }
            }
            (LifecycleState::AttemptClaim { .. }, Transition::Activate(work)) => {
                LifecycleState::Active(work)
            }
            (_, Transition::BackToIdle) => LifecycleState::Idle,
            (previous, transition) => {
                let from = previous.name().to_string();
                self.state = previous;
                return Err(Error::InvalidStateTransition {
                    from,
                    event: transition.name().to_string(),
                });
            }
        };
        let task = match &next {
            LifecycleState::Active(work) => Some(work.task.id.clone()),
            _ => None,
        };
        self.state = next;
        self.current.send_replace(task);
        Ok(())
    }

    fn eligible(&self, task: &Task) -> bool {
        self.ctx.identity.roles.can_handle(task.required_role)
            && self.ctx.router.can_execute(task)
            && self.ctx.launchers.supports(task)
    }

    fn claim_jitter(&self) -> Duration {
        let max = self.ctx.config.max_claim_jitter().as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    /// Lease timing for the next claim or renewal, stretched when assignment
    /// writes have been slow.
    fn lease(&self) -> LeaseConfig {
        let latency = Duration::from_millis(self.write_latency_ms.load(Ordering::Relaxed));
        self.ctx.lease.for_latency(latency)
    }

    fn record_latency(&self, elapsed: Duration) {
        let before = self.lease().ttl;
        let millis = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.write_latency_ms.store(millis, Ordering::Relaxed);
        let after = self.lease().ttl;
        if after != before {
            tracing::info!(
                "Assignment write took {:?}, lease TTL now {:?}",
                elapsed,
                after
            );
        }
    }

    /// One step of the lifecycle. Returns how long to wait before the next.
    pub async fn step(&mut self) -> Duration {
        match self.tick().await {
            Ok(wait) => {
                if self.degraded {
                    tracing::info!("Coordination store reachable again, leaving degraded mode");
                    self.degraded = false;
                }
                wait
            }
            Err(e) if e.is_unavailable() => {
                if !self.degraded {
                    tracing::warn!("Coordination store unavailable, entering degraded mode: {}", e);
                    self.degraded = true;
                }
                self.on_unavailable().await
            }
            Err(e) => {
                tracing::warn!("{} step failed: {}", self.state.name(), e);
                self.release_to_idle(&e.to_string()).await;
                self.ctx.config.idle_interval()
            }
        }
    }

    /// Keep working while the lease lasts; stop once it can no longer be valid.
    async fn on_unavailable(&mut self) -> Duration {
        let now = self.ctx.clock.now();
        let lease_expired = match &self.state {
            LifecycleState::Active(work) => Some(is_orphan(&work.lease, now)),
            _ => None,
        };
        match lease_expired {
            Some(false) => self.ctx.config.lease_check_interval(),
            Some(true) => {
                self.release_to_idle("lease expired while the store was unreachable")
                    .await;
                self.ctx.config.degraded_idle_interval()
            }
            None => {
                self.reset();
                self.ctx.config.degraded_idle_interval()
            }
        }
    }

    async fn tick(&mut self) -> Result<Duration> {
        match self.state {
            LifecycleState::Idle => self.tick_idle().await,
            LifecycleState::AttemptClaim { .. } => self.tick_claim().await,
            LifecycleState::Active(_) => self.tick_active().await,
        }
    }

    async fn tick_idle(&mut self) -> Result<Duration> {
        let store = self.ctx.store.as_ref();
        let schedule = read_document::<Schedule>(store).await?.value;
        let assignments = read_document::<Assignments>(store).await?.value;
        let now = self.ctx.clock.now();

        let candidate = select_candidate(&schedule, &assignments, &self.ctx.identity.id, now, |t| {
            self.eligible(t)
        })
        .cloned();
        match candidate {
            Some(task) => {
                tracing::debug!("Node {} will try to claim {}", self.ctx.short_id(), task.id);
                self.apply(Transition::BeginClaim(task))?;
                Ok(self.claim_jitter())
            }
            None => Ok(self.ctx.config.idle_interval()),
        }
    }

    async fn tick_claim(&mut self) -> Result<Duration> {
        let candidate_id = match &self.state {
            LifecycleState::AttemptClaim { candidate } => candidate.id.clone(),
            other => {
                return Err(Error::InvalidStateTransition {
                    from: other.name().to_string(),
                    event: "claim".into(),
                })
            }
        };

        // the schedule may have changed during the jitter sleep
        let schedule = read_document::<Schedule>(self.ctx.store.as_ref()).await?.value;
        let Some(task) = schedule.get(&candidate_id).cloned() else {
            tracing::debug!("Task {} left the schedule before the claim", candidate_id);
            self.apply(Transition::BackToIdle)?;
            return Ok(Duration::ZERO);
        };
        if !self.eligible(&task) {
            tracing::debug!("Task {} no longer runs on this node", task.id);
            self.apply(Transition::BackToIdle)?;
            return Ok(Duration::ZERO);
        }

        let started = Instant::now();
        let outcome = self
            .ctx
            .writer
            .mutate::<Assignments, _>(self.claim(&task.id))
            .await;
        self.record_latency(started.elapsed());
        match outcome {
            Ok(WriteOutcome::Written { value, .. }) => {
                let lease = value.get(&task.id).cloned().ok_or_else(|| {
                    Error::Internal(format!("claim of {} not in written document", task.id))
                })?;
                match self.start_runner(&task).await {
                    Ok(runner) => {
                        tracing::info!(
                            "Node {} claimed {} until {}",
                            self.ctx.short_id(),
                            task.id,
                            lease.lease_expires_at
                        );
                        self.apply(Transition::Activate(Box::new(ActiveWork {
                            task,
                            lease,
                            runner,
                        })))?;
                        Ok(Duration::ZERO)
                    }
                    Err(e) => {
                        tracing::warn!("Could not start {}: {}", task.id, e);
                        self.release_assignment(&task.id).await;
                        self.apply(Transition::BackToIdle)?;
                        Ok(self.ctx.config.idle_interval())
                    }
                }
            }
            Ok(WriteOutcome::Aborted(reason)) => {
                tracing::debug!("Claim of {} abandoned: {}", task.id, reason);
                self.apply(Transition::BackToIdle)?;
                Ok(self.claim_jitter())
            }
            Ok(WriteOutcome::Unchanged(_)) => {
                self.apply(Transition::BackToIdle)?;
                Ok(self.claim_jitter())
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!("Lost the race for {}", task.id);
                self.apply(Transition::BackToIdle)?;
                Ok(self.claim_jitter())
            }
            Err(e) => {
                self.apply(Transition::BackToIdle)?;
                Err(e)
            }
        }
    }

    fn claim(&self, task_id: &str) -> impl FnMut(&mut Assignments) -> Mutation + Send + 'static {
        let task_id = task_id.to_string();
        let node_id = self.ctx.identity.id.clone();
        let region = Some(self.ctx.identity.region.clone());
        let lease = self.lease();
        let clock = self.ctx.clock.clone();
        move |doc: &mut Assignments| {
            let now = clock.now();
            if let Some(held) = doc.get(&task_id) {
                if !held.is_owned_by(&node_id) && !is_orphan(held, now) {
                    return Mutation::Abort(format!(
                        "{} is held by node {}",
                        task_id,
                        short_id(&held.node_id)
                    ));
                }
            }
            doc.insert(lease.new_lease(task_id.clone(), node_id.clone(), region.clone(), now));
            Mutation::Changed(format!(
                "feat(assignments): node {} claims {}",
                short_id(&node_id),
                task_id
            ))
        }
    }

    async fn start_runner(&self, task: &Task) -> Result<Runner> {
        if task.is_privileged() {
            return Ok(Runner::Privileged {
                next_run: Instant::now(),
            });
        }
        let name = task
            .renderer_name()
            .ok_or_else(|| Error::Launcher(format!("task {} has no renderer", task.id)))?;
        let launcher = self
            .ctx
            .launchers
            .get(name)
            .ok_or_else(|| Error::Launcher(format!("no launcher registered for {}", name)))?;
        let worker = launcher.launch(task).await?;
        Ok(Runner::External {
            worker,
            monitor: HealthMonitor::new(self.ctx.config.resilience.unhealthy_probe_threshold),
            next_probe: Instant::now() + self.ctx.config.health_check_interval(),
        })
    }

    async fn tick_active(&mut self) -> Result<Duration> {
        let mut work = match std::mem::replace(&mut self.state, LifecycleState::Idle) {
            LifecycleState::Active(work) => work,
            other => {
                let from = other.name().to_string();
                self.state = other;
                return Err(Error::InvalidStateTransition {
                    from,
                    event: "work".into(),
                });
            }
        };
        let result = self.active_pass(&mut work).await;
        self.state = LifecycleState::Active(work);

        match result? {
            ActiveStep::Continue(wait) => Ok(wait),
            ActiveStep::Release(reason) => {
                self.release_to_idle(&reason).await;
                Ok(Duration::ZERO)
            }
        }
    }

    async fn active_pass(&self, work: &mut ActiveWork) -> Result<ActiveStep> {
        let store = self.ctx.store.as_ref();
        let node_id = &self.ctx.identity.id;

        let assignments = read_document::<Assignments>(store).await?.value;
        match assignments.get(&work.task.id) {
            Some(a) if a.is_owned_by(node_id) => work.lease = a.clone(),
            Some(a) => {
                return Ok(ActiveStep::Release(format!(
                    "lease on {} taken over by node {}",
                    work.task.id,
                    short_id(&a.node_id)
                )))
            }
            None => return Ok(ActiveStep::Release(format!("lease on {} lost", work.task.id))),
        }

        // renewal comes before anything that could take long
        if self.lease().needs_renewal(&work.lease, self.ctx.clock.now()) {
            match self.renew(&work.task.id).await? {
                Some(lease) => work.lease = lease,
                None => {
                    return Ok(ActiveStep::Release(format!(
                        "lease on {} lost during renewal",
                        work.task.id
                    )))
                }
            }
        }

        let schedule = read_document::<Schedule>(store).await?.value;
        match schedule.get(&work.task.id) {
            None => {
                return Ok(ActiveStep::Release(format!(
                    "{} removed from the schedule",
                    work.task.id
                )))
            }
            Some(task) if !self.eligible(task) => {
                return Ok(ActiveStep::Release(format!(
                    "{} no longer runs on this node",
                    task.id
                )))
            }
            Some(task) if *task != work.task => {
                tracing::info!("Definition of {} changed", task.id);
                work.task = task.clone();
            }
            Some(_) => {}
        }

        let wait = match &mut work.runner {
            Runner::Privileged { next_run } => {
                if Instant::now() >= *next_run {
                    if let Err(e) = self.run_privileged(&work.task).await {
                        if e.is_unavailable() {
                            return Err(e);
                        }
                        tracing::warn!("{} pass failed: {}", work.task.id, e);
                    }
                    *next_run = Instant::now() + privileged_interval(&work.task);
                }
                next_run.saturating_duration_since(Instant::now())
            }
            Runner::External {
                worker,
                monitor,
                next_probe,
            } => {
                if worker.has_exited() {
                    return Ok(ActiveStep::Release(format!(
                        "worker for {} exited",
                        work.task.id
                    )));
                }
                if Instant::now() >= *next_probe {
                    let status = worker.probe().await;
                    match monitor.record(&status) {
                        Verdict::Healthy => {}
                        Verdict::Degraded(failures) => tracing::warn!(
                            "Health probe for {} failed ({} in a row): {}",
                            work.task.id,
                            failures,
                            status.detail
                        ),
                        Verdict::Unhealthy => {
                            return Ok(ActiveStep::Release(format!(
                                "worker for {} unhealthy: {}",
                                work.task.id, status.detail
                            )))
                        }
                    }
                    *next_probe = Instant::now() + self.ctx.config.health_check_interval();
                }
                next_probe.saturating_duration_since(Instant::now())
            }
        };

        let renew_in = self
            .lease()
            .time_until_renewal(&work.lease, self.ctx.clock.now());
        Ok(ActiveStep::Continue(
            wait.min(renew_in).min(self.ctx.config.lease_check_interval()),
        ))
    }

    /// Extend our lease. `None` when it is no longer ours.
    async fn renew(&self, task_id: &str) -> Result<Option<Assignment>> {
        let id = task_id.to_string();
        let node_id = self.ctx.identity.id.clone();
        let lease = self.lease();
        let clock = self.ctx.clock.clone();
        let started = Instant::now();
        let outcome = self
            .ctx
            .writer
            .mutate::<Assignments, _>(move |doc| match doc.assignments.get_mut(&id) {
                Some(a) if a.is_owned_by(&node_id) => {
                    lease.renew(a, clock.now());
                    Mutation::Changed(format!(
                        "chore(assignments): node {} renews {}",
                        short_id(&node_id),
                        id
                    ))
                }
                _ => Mutation::Abort(format!("{} is no longer held", id)),
            })
            .await?;
        self.record_latency(started.elapsed());
        match outcome {
            WriteOutcome::Written { value, .. } => {
                tracing::debug!("Renewed lease on {}", task_id);
                Ok(value.get(task_id).cloned())
            }
            WriteOutcome::Unchanged(_) | WriteOutcome::Aborted(_) => Ok(None),
        }
    }

    async fn run_privileged(&self, task: &Task) -> Result<()> {
        let node_timeout = self.ctx.config.node_timeout();
        let clock = self.ctx.clock.clone();
        match task.kind {
            TaskKind::Healer { .. } => {
                let healer = Healer::new(node_timeout);
                let report = self
                    .ctx
                    .writer
                    .submit(move |store, policy| async move {
                        healer.run(store.as_ref(), &policy, clock.as_ref()).await
                    })
                    .await?;
                tracing::debug!("Healer pass: {:?}", report);
            }
            TaskKind::Governor { .. } => {
                let governor = Governor::new(node_timeout, self.ctx.router.clone());
                let report = self
                    .ctx
                    .writer
                    .submit(move |store, policy| async move {
                        governor.run(store.as_ref(), &policy, clock.as_ref()).await
                    })
                    .await?;
                tracing::debug!("Governor pass: {:?}", report.outcome);
            }
            _ => {}
        }
        Ok(())
    }

    fn reset(&mut self) -> LifecycleState {
        let previous = std::mem::replace(&mut self.state, LifecycleState::Idle);
        self.current.send_replace(None);
        previous
    }

    /// Stop any worker, give the lease back if it is still ours, go idle.
    async fn release_to_idle(&mut self, reason: &str) {
        let LifecycleState::Active(mut work) = self.reset() else {
            return;
        };
        tracing::info!("Releasing {}: {}", work.task.id, reason);
        if let Runner::External { worker, .. } = &mut work.runner {
            if let Err(e) = worker.stop().await {
                tracing::warn!("Failed to stop worker for {}: {}", work.task.id, e);
            }
        }
        self.release_assignment(&work.task.id).await;
    }

    async fn release_assignment(&self, task_id: &str) {
        let id = task_id.to_string();
        let node_id = self.ctx.identity.id.clone();
        let result = self
            .ctx
            .writer
            .mutate::<Assignments, _>(move |doc| {
                if doc.release(&id, &node_id) {
                    Mutation::Changed(format!(
                        "chore(assignments): node {} releases {}",
                        short_id(&node_id),
                        id
                    ))
                } else {
                    Mutation::Unchanged
                }
            })
            .await;
        if let Err(e) = result {
            tracing::warn!("Could not release {}: {}", task_id, e);
        }
    }

    /// Drive the lifecycle until `shutdown` flips, then release within the
    /// configured grace period.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let wait = self.step().await;
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let grace = self.ctx.config.shutdown_grace();
        if tokio::time::timeout(grace, self.release_to_idle("shutting down"))
            .await
            .is_err()
        {
            tracing::warn!("Release did not finish within {:?}", grace);
        }
    }
}

fn privileged_interval(task: &Task) -> Duration {
    match task.kind {
        TaskKind::Healer { interval_secs } | TaskKind::Governor { interval_secs } => {
            Duration::from_secs(interval_secs)
        }
        _ => Duration::ZERO,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Config, ManualClock};
    use crate::coordination::{GeographicRouter, RoleSet};
    use crate::node::runtime::NodeIdentity;
    use crate::node::worker::{LauncherRegistry, SimulatedLauncher};
    use crate::store::MemoryStore;
    use std::sync::Arc;

    fn machine(
        store: &MemoryStore,
        clock: &ManualClock,
        launcher: &SimulatedLauncher,
    ) -> NodeStateMachine {
        let mut config = Config::default();
        config.jitter.max_claim_jitter_ms = 0;
        let identity = NodeIdentity::generate("default", RoleSet::all(), clock.now());
        let launchers = LauncherRegistry::new().with("text", Arc::new(launcher.clone()));
        let (ctx, _writer) = NodeContext::new(
            identity,
            config,
            Arc::new(store.clone()),
            Arc::new(clock.clone()),
            GeographicRouter::disabled("default"),
            launchers,
        );
        NodeStateMachine::new(ctx)
    }

    #[tokio::test]
    async fn test_claims_and_activates() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let launcher = SimulatedLauncher::new();
        store
            .seed(&Schedule {
                version: 1,
                tasks: vec![Task::renderer("news", "text", 2)],
            })
            .unwrap();

        let mut m = machine(&store, &clock, &launcher);
        let current = m.current_task();
        m.step().await;
        assert_eq!(m.state().name(), "attempt_claim");
        m.step().await;
        assert!(m.state().is_active());
        assert_eq!(current.borrow().as_deref(), Some("news"));
        assert_eq!(launcher.launched(), 1);

        let held = store.snapshot::<Assignments>().unwrap();
        assert_eq!(held.get("news").unwrap().node_id, m.ctx.identity.id);
    }

    #[tokio::test]
    async fn test_invalid_transition_keeps_state() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let mut m = machine(&store, &clock, &SimulatedLauncher::new());
        let err = m
            .apply(Transition::Activate(Box::new(ActiveWork {
                task: Task::healer(60),
                lease: m.ctx.lease.new_lease("healer", "x", None, clock.now()),
                runner: Runner::Privileged {
                    next_run: Instant::now(),
                },
            })))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidStateTransition { .. }));
        assert_eq!(m.state().name(), "idle");
    }

    #[tokio::test]
    async fn test_unhealthy_worker_releases_task() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let launcher = SimulatedLauncher::new();
        store
            .seed(&Schedule {
                version: 1,
                tasks: vec![Task::renderer("news", "text", 2)],
            })
            .unwrap();
        let mut m = machine(&store, &clock, &launcher);
        m.ctx = {
            let mut ctx = m.ctx.clone();
            let mut config = (*ctx.config).clone();
            config.intervals.health_check_secs = 0;
            ctx.config = Arc::new(config);
            ctx
        };
        m.step().await;
        m.step().await;
        assert!(m.state().is_active());

        launcher.set_healthy(false);
        for _ in 0..3 {
            m.step().await;
        }
        assert_eq!(m.state().name(), "idle");
        assert!(store.snapshot::<Assignments>().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_claim_rechecks_eligibility_after_jitter() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        store
            .seed(&Schedule {
                version: 1,
                tasks: vec![Task::renderer("news", "text", 2)],
            })
            .unwrap();
        let mut m = machine(&store, &clock, &SimulatedLauncher::new());
        m.step().await;
        assert_eq!(m.state().name(), "attempt_claim");

        // pinned elsewhere while this node waited
        store
            .seed(&Schedule {
                version: 2,
                tasks: vec![Task::renderer("news", "text", 2).with_region("eu-west")],
            })
            .unwrap();
        m.step().await;
        assert_eq!(m.state().name(), "idle");
        assert!(store.snapshot::<Assignments>().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_slow_writes_stretch_the_lease() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        store
            .seed(&Schedule {
                version: 1,
                tasks: vec![Task::renderer("news", "text", 2)],
            })
            .unwrap();
        let mut m = machine(&store, &clock, &SimulatedLauncher::new());
        m.record_latency(Duration::from_secs(2));
        m.step().await;
        m.step().await;
        assert!(m.state().is_active());

        let held = store.snapshot::<Assignments>().unwrap();
        let lease = held.get("news").unwrap();
        assert_eq!(
            lease.lease_expires_at - lease.claimed_at,
            chrono::Duration::seconds(600)
        );
        // the claim itself was fast, so renewals go back to the normal profile
        assert_eq!(m.lease().ttl, m.ctx.lease.ttl);
    }

    #[tokio::test]
    async fn test_outage_keeps_work_until_lease_expires() {
        let store = MemoryStore::new();
        let clock = ManualClock::new(Utc::now());
        let launcher = SimulatedLauncher::new();
        store
            .seed(&Schedule {
                version: 1,
                tasks: vec![Task::renderer("news", "text", 2)],
            })
            .unwrap();
        let mut m = machine(&store, &clock, &launcher);
        m.step().await;
        m.step().await;
        assert!(m.state().is_active());

        store.fail_next_reads(1);
        m.step().await;
        assert!(m.is_degraded());
        assert!(m.state().is_active());

        clock.advance(chrono::Duration::seconds(301));
        store.fail_next_reads(1);
        m.step().await;
        assert_eq!(m.state().name(), "idle");
        assert!(store.snapshot::<Assignments>().unwrap().is_empty());

        // store back: leaves degraded mode and claims again
        m.step().await;
        assert!(!m.is_degraded());
        assert_eq!(m.state().name(), "attempt_claim");
    }

    #[test]
    fn test_select_candidate_skips_live_leases() {
        let now = Utc::now();
        let schedule = Schedule {
            version: 1,
            tasks: vec![Task::renderer("a", "text", 2), Task::renderer("b", "text", 3)],
        };
        let lease = crate::coordination::LeaseConfig::default();
        let mut assignments = Assignments::default();
        assignments.insert(lease.new_lease("a", "other", None, now));
        let picked = select_candidate(&schedule, &assignments, "me", now, |_| true).unwrap();
        assert_eq!(picked.id, "b");

        // an expired lease is up for grabs
        let later = now + chrono::Duration::hours(1);
        assignments.insert(lease.new_lease("b", "other", None, now));
        let picked = select_candidate(&schedule, &assignments, "me", later, |_| true).unwrap();
        assert_eq!(picked.id, "a");
    }
}
