//! A task whose holder vanished is reclaimed once its lease expires

use chrono::{Duration, Utc};
use std::sync::Arc;
use swarmlease::common::{Clock, Config, ManualClock};
use swarmlease::coordination::{GeographicRouter, RoleSet};
use swarmlease::model::{Assignments, Schedule, Task};
use swarmlease::node::{LauncherRegistry, NodeStateMachine, SimulatedLauncher};
use swarmlease::store::MemoryStore;
use swarmlease::{NodeContext, NodeIdentity};

fn node(store: &MemoryStore, clock: &ManualClock) -> (NodeStateMachine, String) {
    let mut config = Config::default();
    config.jitter.max_claim_jitter_ms = 0;
    let identity = NodeIdentity::generate("default", RoleSet::all(), clock.now());
    let id = identity.id.clone();
    let launchers = LauncherRegistry::new().with("text", Arc::new(SimulatedLauncher::new()));
    let (ctx, _writer) = NodeContext::new(
        identity,
        config,
        Arc::new(store.clone()),
        Arc::new(clock.clone()),
        GeographicRouter::disabled("default"),
        launchers,
    );
    (NodeStateMachine::new(ctx), id)
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(Utc::now());
    store
        .seed(&Schedule {
            version: 1,
            tasks: vec![Task::renderer("news", "text", 2)],
        })
        .unwrap();

    let (mut crashed, crashed_id) = node(&store, &clock);
    crashed.step().await;
    crashed.step().await;
    assert!(crashed.state().is_active());
    // the holder disappears without releasing
    drop(crashed);

    let (mut survivor, survivor_id) = node(&store, &clock);

    // lease still live: nothing to claim
    clock.advance(Duration::seconds(200));
    survivor.step().await;
    assert_eq!(survivor.state().name(), "idle");

    // past the 300s TTL the task is an orphan
    clock.advance(Duration::seconds(101));
    survivor.step().await;
    survivor.step().await;
    assert!(survivor.state().is_active());

    let assignments = store.snapshot::<Assignments>().unwrap();
    let holder = &assignments.get("news").unwrap().node_id;
    assert_eq!(holder, &survivor_id);
    assert_ne!(holder, &crashed_id);
}

#[tokio::test]
async fn test_active_node_renews_before_expiry() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(Utc::now());
    store
        .seed(&Schedule {
            version: 1,
            tasks: vec![Task::renderer("news", "text", 2)],
        })
        .unwrap();

    let (mut holder, _) = node(&store, &clock);
    holder.step().await;
    holder.step().await;
    let first_expiry = store
        .snapshot::<Assignments>()
        .unwrap()
        .get("news")
        .unwrap()
        .lease_expires_at;

    // below half the TTL remaining: renew
    clock.advance(Duration::seconds(160));
    holder.step().await;
    let renewed = store.snapshot::<Assignments>().unwrap();
    let lease = renewed.get("news").unwrap();
    assert!(lease.lease_expires_at > first_expiry);
    assert!(store
        .history()
        .iter()
        .any(|d| d.starts_with("chore(assignments):") && d.contains("renews news")));

    // a competitor sees a live lease and stays idle
    clock.advance(Duration::seconds(200));
    let (mut competitor, _) = node(&store, &clock);
    competitor.step().await;
    assert_eq!(competitor.state().name(), "idle");
}
