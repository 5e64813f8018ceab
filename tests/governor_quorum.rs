//! Governor triggers only fire with enough of the swarm alive

use chrono::{Duration, Utc};
use std::sync::Arc;
use swarmlease::common::{Clock, ManualClock, RetryPolicy};
use swarmlease::coordination::{GeographicRouter, RoleSet};
use swarmlease::model::{
    Action, Comparison, Condition, Node, Quorum, RegionalPolicy, Roster, Schedule, Task,
    TaskAggregate, Trigger, TriggerSet,
};
use swarmlease::ops::{Governor, GovernorOutcome, TriggerStatus};
use swarmlease::store::MemoryStore;

fn roster(alive: usize, dead: usize, now: chrono::DateTime<Utc>) -> Roster {
    let mut roster = Roster::default();
    for i in 0..alive {
        roster.upsert(Node::new(format!("alive-{}", i), "default", RoleSet::all(), now));
    }
    for i in 0..dead {
        let mut node = Node::new(format!("dead-{}", i), "default", RoleSet::all(), now);
        node.last_heartbeat = now - Duration::hours(1);
        roster.upsert(node);
    }
    roster
}

fn scale_up(quorum: Quorum) -> TriggerSet {
    TriggerSet {
        rules: vec![Trigger {
            id: "scale-up".into(),
            description: Some("add a worker when few tasks exist".into()),
            enabled: true,
            quorum: Some(quorum),
            condition: Condition::TaskMetric {
                aggregate: TaskAggregate::Total,
                operator: Comparison::Lt,
                threshold: 3.0,
            },
            action: Action::AddTask {
                task: Task::renderer("extra", "text", 5),
            },
        }],
    }
}

fn governor(router: GeographicRouter) -> Governor {
    Governor::new(std::time::Duration::from_secs(900), Arc::new(router))
}

#[tokio::test]
async fn test_quorum_unmet_skips_and_writes_nothing() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(Utc::now());
    store.seed(&roster(2, 0, clock.now())).unwrap();
    store
        .seed(&scale_up(Quorum {
            min_nodes_alive: 3,
            min_percent_alive: 0.0,
        }))
        .unwrap();
    store
        .seed(&Schedule {
            version: 4,
            tasks: vec![Task::healer(60)],
        })
        .unwrap();

    let report = governor(GeographicRouter::disabled("default"))
        .run(&store, &RetryPolicy::immediate(3), &clock)
        .await
        .unwrap();
    assert_eq!(report.outcome, GovernorOutcome::NoChange);
    assert_eq!(report.quorum_unmet().collect::<Vec<_>>(), vec!["scale-up"]);
    assert_eq!(store.publish_count(), 0);

    // a third node comes up
    store.seed(&roster(3, 0, clock.now())).unwrap();
    let report = governor(GeographicRouter::disabled("default"))
        .run(&store, &RetryPolicy::immediate(3), &clock)
        .await
        .unwrap();
    assert_eq!(report.outcome, GovernorOutcome::Published { version: 5 });
    assert!(store.snapshot::<Schedule>().unwrap().contains("extra"));
}

#[tokio::test]
async fn test_percentage_quorum_counts_dead_nodes() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(Utc::now());
    // 2 of 5 alive = 40%
    store.seed(&roster(2, 3, clock.now())).unwrap();
    store
        .seed(&scale_up(Quorum {
            min_nodes_alive: 1,
            min_percent_alive: 50.0,
        }))
        .unwrap();

    let report = governor(GeographicRouter::disabled("default"))
        .run(&store, &RetryPolicy::immediate(3), &clock)
        .await
        .unwrap();
    assert_eq!(
        report.evaluations[0].status,
        TriggerStatus::QuorumUnmet { alive: 2, total: 5 }
    );
    assert_eq!(report.outcome, GovernorOutcome::NoChange);
}

#[tokio::test]
async fn test_strong_schedule_writes_defer_without_enough_nodes() {
    let store = MemoryStore::new();
    let clock = ManualClock::new(Utc::now());
    store.seed(&roster(1, 0, clock.now())).unwrap();
    store
        .seed(&scale_up(Quorum {
            min_nodes_alive: 1,
            min_percent_alive: 0.0,
        }))
        .unwrap();

    let mut policy = RegionalPolicy {
        enabled: true,
        ..Default::default()
    };
    policy.consistency.insert(
        swarmlease::model::OperationClass::ScheduleChanges,
        swarmlease::model::ConsistencyPolicy::Strong { quorum: 2 },
    );
    let report = governor(GeographicRouter::new("default", policy, false))
        .run(&store, &RetryPolicy::immediate(3), &clock)
        .await
        .unwrap();
    assert_eq!(report.outcome, GovernorOutcome::Deferred { needed: 2, alive: 1 });
    assert_eq!(store.publish_count(), 0);
}
