//! Retry policy with jittered exponential backoff
//!
//! Every store write in the swarm goes through a [`RetryPolicy`]. Conflicts
//! are retried quickly (another node just won a race), backend outages use
//! a longer base delay. Exhausting the attempts surfaces the last error.

use crate::common::{Error, Result};
use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: usize,
    /// Base delay after a conflict.
    pub base_delay: Duration,
    /// Base delay after the backend was unreachable.
    pub unavailable_delay: Duration,
    /// Upper bound for any single backoff.
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of each delay that is randomized (0.0 - 1.0).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(250),
            unavailable_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests and single-shot operator commands.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            unavailable_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    /// Should `err` be retried after `attempt` (1-based) failed attempts?
    pub fn should_retry(&self, err: &Error, attempt: usize) -> bool {
        err.is_retryable() && attempt < self.max_attempts
    }

    /// Backoff before the next attempt, without jitter.
    pub fn base_backoff(&self, err: &Error, attempt: usize) -> Duration {
        let base = if err.is_unavailable() {
            self.unavailable_delay
        } else {
            self.base_delay
        };
        let exp = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let secs = (base.as_secs_f64() * exp).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Backoff before the next attempt, with jitter applied.
    pub fn backoff(&self, err: &Error, attempt: usize) -> Duration {
        let base = self.base_backoff(err, attempt);
        if self.jitter <= 0.0 || base.is_zero() {
            return base;
        }
        let spread = base.mul_f64(self.jitter.min(1.0));
        let fixed = base - spread;
        let random = rand::thread_rng().gen_range(0.0..=1.0);
        fixed + spread.mul_f64(random)
    }

    /// Run `f` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out.
    pub async fn run<F, Fut, T>(&self, what: &str, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(result) => return Ok(result),
                Err(e) if self.should_retry(&e, attempt) => {
                    let delay = self.backoff(&e, attempt);
                    tracing::debug!(
                        "{} attempt {} failed: {}, retrying in {:?}",
                        what,
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy {
            jitter: 0.0,
            max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        let conflict = Error::conflict("assignments");
        assert_eq!(policy.backoff(&conflict, 1), Duration::from_millis(250));
        assert_eq!(policy.backoff(&conflict, 2), Duration::from_millis(500));
        assert_eq!(policy.backoff(&conflict, 5), Duration::from_secs(1));
    }

    #[test]
    fn test_unavailable_uses_longer_base() {
        let policy = RetryPolicy {
            jitter: 0.0,
            ..Default::default()
        };
        let down = Error::StoreUnavailable("fetch failed".into());
        assert_eq!(policy.backoff(&down, 1), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::default();
        let conflict = Error::conflict("schedule");
        for _ in 0..100 {
            let d = policy.backoff(&conflict, 1);
            assert!(d >= Duration::from_millis(125));
            assert!(d <= Duration::from_millis(250));
        }
    }

    #[tokio::test]
    async fn test_run_retries_conflicts_until_exhausted() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::immediate(3);
        let result: Result<()> = policy
            .run("claim", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::conflict("assignments")) }
            })
            .await;
        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_run_does_not_retry_fatal_errors() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::immediate(5);
        let result: Result<()> = policy
            .run("claim", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::InvalidConfig("nope".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_returns_first_success() {
        let calls = AtomicUsize::new(0);
        let policy = RetryPolicy::immediate(5);
        let value = policy
            .run("read", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(Error::StoreUnavailable("flaky".into()))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }
}
