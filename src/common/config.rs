//! Configuration for swarmlease nodes
//!
//! Layered with the `config` crate: built-in defaults, then an optional TOML
//! file, then `SWARMLEASE__SECTION__KEY` environment variables.

use crate::common::retry::RetryPolicy;
use crate::common::{Error, Result};
use crate::coordination::lease::LeaseConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable overriding the node region
pub const REGION_ENV: &str = "SWARMLEASE_REGION";
/// Environment variable pointing at a regional policy file
pub const GEO_CONFIG_ENV: &str = "SWARMLEASE_GEO_CONFIG";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeSettings,
    pub intervals: IntervalConfig,
    pub timeouts: TimeoutConfig,
    pub jitter: JitterConfig,
    pub lease: LeaseSettings,
    pub resilience: ResilienceConfig,
    pub geo: GeoSettings,

    /// Logging level
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeSettings::default(),
            intervals: IntervalConfig::default(),
            timeouts: TimeoutConfig::default(),
            jitter: JitterConfig::default(),
            lease: LeaseSettings::default(),
            resilience: ResilienceConfig::default(),
            geo: GeoSettings::default(),
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSettings {
    /// Where the node keeps its `.node_id` file
    pub data_dir: PathBuf,
    /// Re-use the id from `.node_id` across restarts
    pub persist_node_id: bool,
    /// Comma-separated roles, all roles when unset
    pub roles: Option<String>,
    pub region: Option<String>,
}

impl Default for NodeSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./swarm-data"),
            persist_node_id: false,
            roles: None,
            region: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    pub node_heartbeat_secs: u64,
    pub idle_loop_secs: u64,
    pub health_check_secs: u64,
    /// How often an active node checks its lease and the schedule
    pub lease_check_secs: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            node_heartbeat_secs: 300,
            idle_loop_secs: 15,
            health_check_secs: 20,
            lease_check_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub node_timeout_secs: u64,
    pub git_operation_secs: u64,
    pub health_probe_secs: u64,
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            node_timeout_secs: 900,
            git_operation_secs: 30,
            health_probe_secs: 5,
            shutdown_grace_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    /// Upper bound of the random wait before a claim
    pub max_claim_jitter_ms: u64,
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            max_claim_jitter_ms: 5000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaseSettings {
    pub ttl_secs: u64,
    /// Renew once less than this fraction of the TTL remains
    pub renewal_threshold_fraction: f64,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            renewal_threshold_fraction: 0.5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub max_publish_attempts: usize,
    pub retry_base_ms: u64,
    pub unavailable_retry_ms: u64,
    pub max_backoff_secs: u64,
    /// Consecutive failed health probes before the worker is declared unhealthy
    pub unhealthy_probe_threshold: u32,
    /// Idle sleep used while the store is unreachable
    pub degraded_idle_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_publish_attempts: 4,
            retry_base_ms: 250,
            unavailable_retry_ms: 2000,
            max_backoff_secs: 30,
            unhealthy_probe_threshold: 3,
            degraded_idle_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoSettings {
    pub enabled: bool,
    pub policy_path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from `path` (or `./swarmlease.toml` when present)
    /// and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name("swarmlease").required(false)),
        };
        builder = builder.add_source(
            config::Environment::with_prefix("SWARMLEASE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: Config = builder
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| Error::InvalidConfig(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if !(60..=1800).contains(&self.lease.ttl_secs) {
            return Err(Error::InvalidConfig(format!(
                "lease.ttl_secs must be within 60..=1800, got {}",
                self.lease.ttl_secs
            )));
        }
        let fraction = self.lease.renewal_threshold_fraction;
        if !(fraction > 0.0 && fraction < 1.0) {
            return Err(Error::InvalidConfig(format!(
                "lease.renewal_threshold_fraction must be in (0, 1), got {}",
                fraction
            )));
        }
        if self.timeouts.node_timeout_secs <= self.intervals.node_heartbeat_secs {
            return Err(Error::InvalidConfig(
                "timeouts.node_timeout_secs must exceed intervals.node_heartbeat_secs".into(),
            ));
        }
        if self.resilience.max_publish_attempts == 0 {
            return Err(Error::InvalidConfig(
                "resilience.max_publish_attempts must be at least 1".into(),
            ));
        }
        if self.resilience.unhealthy_probe_threshold == 0 {
            return Err(Error::InvalidConfig(
                "resilience.unhealthy_probe_threshold must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn node_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.node_timeout_secs)
    }

    pub fn node_heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.node_heartbeat_secs)
    }

    pub fn idle_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.idle_loop_secs)
    }

    pub fn degraded_idle_interval(&self) -> Duration {
        Duration::from_secs(self.resilience.degraded_idle_secs)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.health_check_secs)
    }

    pub fn lease_check_interval(&self) -> Duration {
        Duration::from_secs(self.intervals.lease_check_secs)
    }

    pub fn max_claim_jitter(&self) -> Duration {
        Duration::from_millis(self.jitter.max_claim_jitter_ms)
    }

    pub fn git_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.git_operation_secs)
    }

    pub fn health_probe_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.health_probe_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.timeouts.shutdown_grace_secs)
    }

    pub fn lease_config(&self) -> LeaseConfig {
        LeaseConfig {
            ttl: Duration::from_secs(self.lease.ttl_secs),
            renewal_threshold_fraction: self.lease.renewal_threshold_fraction,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.resilience.max_publish_attempts,
            base_delay: Duration::from_millis(self.resilience.retry_base_ms),
            unavailable_delay: Duration::from_millis(self.resilience.unavailable_retry_ms),
            max_delay: Duration::from_secs(self.resilience.max_backoff_secs),
            ..RetryPolicy::default()
        }
    }

    /// Region from the command line, then the environment, then the config file.
    pub fn resolve_region(&self, cli: Option<&str>) -> Option<String> {
        cli.map(str::to_string)
            .or_else(|| std::env::var(REGION_ENV).ok().filter(|r| !r.is_empty()))
            .or_else(|| self.node.region.clone())
    }

    /// Regional policy file from the environment override, then the config file.
    pub fn resolve_geo_policy_path(&self) -> Option<PathBuf> {
        std::env::var_os(GEO_CONFIG_ENV)
            .map(PathBuf::from)
            .or_else(|| self.geo.policy_path.clone())
    }
}
