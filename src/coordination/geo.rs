//! Region-aware task filtering and consistency selection
//!
//! The router is optional. When disabled every write is a plain CAS publish
//! and only a task's `required_region` restricts where it runs.

use crate::common::{Error, Result, RetryPolicy};
use crate::coordination::conflict::{ConflictResolver, ConflictStrategy, RegionPriorities};
use crate::model::{ConsistencyPolicy, ContentList, OperationClass, RegionalPolicy, Task};
use crate::store::{compare_and_write, CoordinationStore, Mutation, WriteOutcome};
use std::time::Duration;

pub const DEFAULT_REGION: &str = "default";

/// How a write of some operation class must be carried out.
#[derive(Debug, Clone, PartialEq)]
pub enum WritePlan {
    /// Single compare-and-swap publish.
    Cas,
    /// Merge with concurrent versions; replicas may lag up to `max_lag`.
    Merge {
        strategy: ConflictStrategy,
        max_lag: Duration,
    },
    /// Strong write not allowed: too few nodes alive.
    Deferred { needed: usize, alive: usize },
}

/// Result of [`GeographicRouter::publish_content`].
#[derive(Debug, Clone, PartialEq)]
pub enum ContentOutcome {
    Written { items: usize },
    Unchanged,
    /// Content writes are strong and the swarm is below quorum.
    Deferred { needed: usize, alive: usize },
}

impl ContentOutcome {
    pub fn is_written(&self) -> bool {
        matches!(self, ContentOutcome::Written { .. })
    }
}

#[derive(Debug, Clone)]
pub struct GeographicRouter {
    region: String,
    policy: RegionalPolicy,
    enabled: bool,
    resolver: ConflictResolver,
}

impl GeographicRouter {
    /// `force_enable` turns the layer on even if the policy leaves it off.
    pub fn new(region: impl Into<String>, policy: RegionalPolicy, force_enable: bool) -> Self {
        let enabled = force_enable || policy.enabled;
        let resolver = ConflictResolver::new(RegionPriorities::from_policy(&policy));
        Self {
            region: region.into(),
            policy,
            enabled,
            resolver,
        }
    }

    pub fn disabled(region: impl Into<String>) -> Self {
        Self::new(region, RegionalPolicy::default(), false)
    }

    /// Region precedence: explicit flag, environment, policy default, `default`.
    pub fn detect_region(
        flag: Option<&str>,
        env: Option<&str>,
        policy: Option<&RegionalPolicy>,
    ) -> String {
        flag.filter(|r| !r.is_empty())
            .or_else(|| env.filter(|r| !r.is_empty()))
            .map(str::to_string)
            .or_else(|| policy.map(|p| p.default_region.clone()))
            .unwrap_or_else(|| DEFAULT_REGION.to_string())
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn policy(&self) -> &RegionalPolicy {
        &self.policy
    }

    pub fn resolver(&self) -> &ConflictResolver {
        &self.resolver
    }

    /// Region filter for claim candidates.
    pub fn can_execute(&self, task: &Task) -> bool {
        if let Some(required) = &task.required_region {
            if required != &self.region {
                return false;
            }
        }
        if !self.enabled {
            return true;
        }
        match self.policy.owner_of(&task.id) {
            Some(owner) => owner == self.region,
            None => true,
        }
    }

    pub fn consistency_for(&self, class: OperationClass) -> ConsistencyPolicy {
        self.policy.consistency_for(class)
    }

    pub fn plan_write(&self, class: OperationClass, alive_nodes: usize) -> WritePlan {
        if !self.enabled {
            return WritePlan::Cas;
        }
        match self.consistency_for(class) {
            ConsistencyPolicy::Strong { quorum } if alive_nodes < quorum => WritePlan::Deferred {
                needed: quorum,
                alive: alive_nodes,
            },
            ConsistencyPolicy::Strong { .. } => WritePlan::Cas,
            ConsistencyPolicy::Eventual {
                max_lag_seconds,
                conflict_resolution,
            } => WritePlan::Merge {
                strategy: conflict_resolution,
                max_lag: Duration::from_secs(max_lag_seconds),
            },
        }
    }

    /// Apply a local edit of the content list to the shared copy.
    ///
    /// The consistency of content writes decides how: strong writes are a
    /// plain CAS and defer below quorum; eventual writes settle conflicting
    /// fields with the configured strategy and must land within `max_lag`.
    /// Existing items never move, new ones are appended.
    pub async fn publish_content(
        &self,
        store: &dyn CoordinationStore,
        policy: &RetryPolicy,
        update: &ContentList,
        description: &str,
        alive_nodes: usize,
    ) -> Result<ContentOutcome> {
        let plan = self.plan_write(OperationClass::ContentUpdates, alive_nodes);
        let (strategy, max_lag) = match plan {
            WritePlan::Deferred { needed, alive } => {
                tracing::warn!(
                    "Content update deferred: {} live node(s), strong consistency needs {}",
                    alive,
                    needed
                );
                return Ok(ContentOutcome::Deferred { needed, alive });
            }
            WritePlan::Cas => (ConflictStrategy::LastWriterWins, None),
            WritePlan::Merge { strategy, max_lag } => (strategy, Some(max_lag)),
        };

        let write = compare_and_write::<ContentList, _>(store, policy, |current| {
            let merged = current.merge_with(update, &self.resolver, strategy);
            if merged == *current {
                return Mutation::Unchanged;
            }
            *current = merged;
            Mutation::Changed(description.to_string())
        });
        let outcome = match max_lag.filter(|lag| !lag.is_zero()) {
            Some(lag) => tokio::time::timeout(lag, write).await.map_err(|_| {
                Error::Timeout(format!("content merge not published within {:?}", lag))
            })??,
            None => write.await?,
        };

        Ok(match outcome {
            WriteOutcome::Written { value, .. } => ContentOutcome::Written {
                items: value.items.len(),
            },
            WriteOutcome::Unchanged(_) | WriteOutcome::Aborted(_) => ContentOutcome::Unchanged,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;

    fn policy() -> RegionalPolicy {
        RegionalPolicy {
            enabled: true,
            ownership: BTreeMap::from([("eu-west".to_string(), vec!["gdpr".to_string()])]),
            ..Default::default()
        }
    }

    #[test]
    fn test_detect_region_precedence() {
        let p = RegionalPolicy {
            default_region: "asia-pacific".into(),
            ..Default::default()
        };
        assert_eq!(
            GeographicRouter::detect_region(Some("us-east"), Some("eu-west"), Some(&p)),
            "us-east"
        );
        assert_eq!(
            GeographicRouter::detect_region(None, Some("eu-west"), Some(&p)),
            "eu-west"
        );
        assert_eq!(GeographicRouter::detect_region(None, None, Some(&p)), "asia-pacific");
        assert_eq!(GeographicRouter::detect_region(None, Some(""), None), DEFAULT_REGION);
    }

    #[test]
    fn test_required_region_always_applies() {
        let router = GeographicRouter::disabled("us-east");
        let pinned = Task::renderer("news", "text", 2).with_region("eu-west");
        assert!(!router.can_execute(&pinned));
        assert!(router.can_execute(&Task::renderer("news", "text", 2)));
    }

    #[test]
    fn test_ownership_patterns_when_enabled() {
        let us = GeographicRouter::new("us-east", policy(), false);
        let eu = GeographicRouter::new("eu-west", policy(), false);
        let task = Task::renderer("gdpr-report", "text", 2);
        assert!(!us.can_execute(&task));
        assert!(eu.can_execute(&task));

        let off = GeographicRouter::new("us-east", RegionalPolicy::default(), false);
        assert!(off.can_execute(&task));
    }

    #[test]
    fn test_plan_write() {
        let mut p = policy();
        p.consistency
            .insert(OperationClass::ScheduleChanges, ConsistencyPolicy::Strong { quorum: 3 });
        let router = GeographicRouter::new("us-east", p, false);
        assert_eq!(
            router.plan_write(OperationClass::ScheduleChanges, 2),
            WritePlan::Deferred { needed: 3, alive: 2 }
        );
        assert_eq!(router.plan_write(OperationClass::ScheduleChanges, 3), WritePlan::Cas);
        assert!(matches!(
            router.plan_write(OperationClass::ContentUpdates, 1),
            WritePlan::Merge { strategy: ConflictStrategy::SemanticMerge, .. }
        ));
        assert_eq!(
            GeographicRouter::disabled("x").plan_write(OperationClass::ScheduleChanges, 0),
            WritePlan::Cas
        );
    }

    fn items(list: &[&str]) -> ContentList {
        ContentList {
            items: list.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_publish_content_merges_concurrent_edits() {
        let store = MemoryStore::new();
        let router = GeographicRouter::new("us-east", policy(), false);
        let retry = RetryPolicy::immediate(3);
        let a = items(&["A", "B"]);
        let b = items(&["A", "C"]);
        router.publish_content(&store, &retry, &a, "add a", 1).await.unwrap();
        router.publish_content(&store, &retry, &b, "add b", 1).await.unwrap();
        let again = router.publish_content(&store, &retry, &b, "add b", 1).await.unwrap();
        assert_eq!(again, ContentOutcome::Unchanged);

        let stored = store.snapshot::<ContentList>().unwrap().items;
        assert_eq!(stored, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn test_publish_content_never_moves_existing_items() {
        let store = MemoryStore::new();
        store.seed(&items(&["a", "b", "c", "d"])).unwrap();
        let router = GeographicRouter::new("us-east", policy(), false);
        let retry = RetryPolicy::immediate(3);

        let mut expected = vec!["a", "b", "c", "d"];
        for item in ["e", "f", "b", "g"] {
            router
                .publish_content(&store, &retry, &items(&[item]), "add", 1)
                .await
                .unwrap();
            if !expected.contains(&item) {
                expected.push(item);
            }
            assert_eq!(store.snapshot::<ContentList>().unwrap().items, expected);
        }
    }

    #[tokio::test]
    async fn test_strong_content_writes_defer_below_quorum() {
        let store = MemoryStore::new();
        let mut p = policy();
        p.consistency
            .insert(OperationClass::ContentUpdates, ConsistencyPolicy::Strong { quorum: 3 });
        let router = GeographicRouter::new("us-east", p, false);
        let retry = RetryPolicy::immediate(3);

        let outcome = router
            .publish_content(&store, &retry, &items(&["A"]), "add", 1)
            .await
            .unwrap();
        assert_eq!(outcome, ContentOutcome::Deferred { needed: 3, alive: 1 });
        assert_eq!(store.publish_count(), 0);

        let outcome = router
            .publish_content(&store, &retry, &items(&["A"]), "add", 3)
            .await
            .unwrap();
        assert_eq!(outcome, ContentOutcome::Written { items: 1 });
    }
}
