//! Lease timing
//!
//! Pure functions over a [`LeaseConfig`]; the caller supplies "now". A lease
//! is live until `lease_expires_at` and orphaned strictly after it.

use crate::common::utils::{to_chrono, until};
use crate::model::{Assignment, NodeId, TaskId};
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Publish latency above which the high-latency profile is used.
pub const HIGH_LATENCY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq)]
pub struct LeaseConfig {
    pub ttl: Duration,
    /// Renew once remaining time drops below `ttl * fraction`.
    pub renewal_threshold_fraction: f64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(300),
            renewal_threshold_fraction: 0.5,
        }
    }
}

impl LeaseConfig {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    /// Timing adjusted to observed publish latency: slow remotes get twice
    /// the TTL so renewals keep up.
    pub fn for_latency(&self, latency: Duration) -> LeaseConfig {
        if latency > HIGH_LATENCY {
            LeaseConfig {
                ttl: self.ttl.saturating_mul(2),
                ..self.clone()
            }
        } else {
            self.clone()
        }
    }

    pub fn renewal_threshold(&self) -> Duration {
        self.ttl.mul_f64(self.renewal_threshold_fraction.clamp(0.0, 1.0))
    }

    pub fn expiry_from(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + to_chrono(self.ttl)
    }

    /// A fresh assignment of `task_id` to `node_id`.
    pub fn new_lease(
        &self,
        task_id: impl Into<TaskId>,
        node_id: impl Into<NodeId>,
        region: Option<String>,
        now: DateTime<Utc>,
    ) -> Assignment {
        Assignment {
            task_id: task_id.into(),
            node_id: node_id.into(),
            region,
            claimed_at: now,
            lease_expires_at: self.expiry_from(now),
            last_heartbeat: now,
        }
    }

    /// Extend the lease in place.
    pub fn renew(&self, assignment: &mut Assignment, now: DateTime<Utc>) {
        assignment.lease_expires_at = self.expiry_from(now);
        assignment.last_heartbeat = now;
    }

    pub fn needs_renewal(&self, assignment: &Assignment, now: DateTime<Utc>) -> bool {
        self.remaining(assignment, now) < self.renewal_threshold()
    }

    pub fn remaining(&self, assignment: &Assignment, now: DateTime<Utc>) -> Duration {
        until(assignment.lease_expires_at, now)
    }

    /// How long the holder can wait before renewing. Zero means renew now.
    pub fn time_until_renewal(&self, assignment: &Assignment, now: DateTime<Utc>) -> Duration {
        self.remaining(assignment, now)
            .saturating_sub(self.renewal_threshold())
    }
}

pub fn is_orphan(assignment: &Assignment, now: DateTime<Utc>) -> bool {
    now > assignment.lease_expires_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_new_lease_expires_after_ttl() {
        let now = Utc::now();
        let config = LeaseConfig::default();
        let lease = config.new_lease("news", "node-a", None, now);
        assert_eq!(lease.lease_expires_at, now + ChronoDuration::seconds(300));
        assert!(!is_orphan(&lease, now + ChronoDuration::seconds(300)));
        assert!(is_orphan(&lease, now + ChronoDuration::seconds(301)));
    }

    #[test]
    fn test_renewal_threshold() {
        let now = Utc::now();
        let config = LeaseConfig::default();
        let mut lease = config.new_lease("news", "node-a", None, now);

        assert!(!config.needs_renewal(&lease, now + ChronoDuration::seconds(149)));
        assert!(config.needs_renewal(&lease, now + ChronoDuration::seconds(151)));
        assert_eq!(
            config.time_until_renewal(&lease, now),
            Duration::from_secs(150)
        );

        let later = now + ChronoDuration::seconds(200);
        config.renew(&mut lease, later);
        assert_eq!(lease.last_heartbeat, later);
        assert!(!config.needs_renewal(&lease, later));
        assert_eq!(lease.claimed_at, now);
    }

    #[test]
    fn test_high_latency_profile_doubles_ttl() {
        let config = LeaseConfig::default();
        assert_eq!(
            config.for_latency(Duration::from_millis(1500)).ttl,
            Duration::from_secs(600)
        );
        assert_eq!(config.for_latency(Duration::from_millis(200)), config);
    }
}
