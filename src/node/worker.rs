//! External workers: launching and health probing
//!
//! Every renderer name maps to a [`Launcher`]. A launched [`Worker`] is
//! probed on an interval; a [`HealthMonitor`] turns consecutive failed
//! probes into an unhealthy verdict.

use crate::common::{Error, Result};
use crate::model::Task;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::process::{Child, Command};

/// Result of one health probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    pub detail: String,
}

impl HealthStatus {
    pub fn healthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: true,
            detail: detail.into(),
        }
    }

    pub fn unhealthy(detail: impl Into<String>) -> Self {
        Self {
            healthy: false,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait Worker: Send + Sync {
    async fn probe(&mut self) -> HealthStatus;

    /// True once the worker process is gone.
    fn has_exited(&mut self) -> bool {
        false
    }

    async fn stop(&mut self) -> Result<()>;
}

#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(&self, task: &Task) -> Result<Box<dyn Worker>>;
}

/// Launchers keyed by renderer name.
#[derive(Default, Clone)]
pub struct LauncherRegistry {
    launchers: HashMap<String, Arc<dyn Launcher>>,
}

impl LauncherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, renderer: impl Into<String>, launcher: Arc<dyn Launcher>) {
        self.launchers.insert(renderer.into(), launcher);
    }

    pub fn with(mut self, renderer: impl Into<String>, launcher: Arc<dyn Launcher>) -> Self {
        self.register(renderer, launcher);
        self
    }

    pub fn get(&self, renderer: &str) -> Option<Arc<dyn Launcher>> {
        self.launchers.get(renderer).cloned()
    }

    /// Privileged tasks run in-process; everything else needs a launcher.
    pub fn supports(&self, task: &Task) -> bool {
        match task.renderer_name() {
            None => task.is_privileged(),
            Some(name) => self.launchers.contains_key(name),
        }
    }

    pub fn renderers(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.launchers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Verdict after recording a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Healthy,
    /// Failed probes so far, below the threshold.
    Degraded(u32),
    Unhealthy,
}

#[derive(Debug, Clone)]
pub struct HealthMonitor {
    threshold: u32,
    consecutive_failures: u32,
}

impl HealthMonitor {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive_failures: 0,
        }
    }

    pub fn record(&mut self, status: &HealthStatus) -> Verdict {
        if status.healthy {
            self.consecutive_failures = 0;
            return Verdict::Healthy;
        }
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold {
            Verdict::Unhealthy
        } else {
            Verdict::Degraded(self.consecutive_failures)
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Spawns a command per task and probes `GET /health` on its port.
///
/// The child gets `SWARMLEASE_TASK_ID`, `SWARMLEASE_TASK` (task JSON) and
/// `PORT` in its environment.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: String,
    args: Vec<String>,
    port: Option<u16>,
    probe_timeout: Duration,
    client: reqwest::Client,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            port: None,
            probe_timeout: Duration::from_secs(5),
            client: reqwest::Client::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Fixed health port. Without one a free port is picked per launch.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    fn pick_port(&self) -> Result<u16> {
        if let Some(port) = self.port {
            return Ok(port);
        }
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        Ok(listener.local_addr()?.port())
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(&self, task: &Task) -> Result<Box<dyn Worker>> {
        let port = self.pick_port()?;
        let task_json = serde_json::to_string(task)?;
        let child = Command::new(&self.program)
            .args(&self.args)
            .env("SWARMLEASE_TASK_ID", &task.id)
            .env("SWARMLEASE_TASK", task_json)
            .env("PORT", port.to_string())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Launcher(format!("failed to start {}: {}", self.program, e)))?;

        tracing::info!(
            "Launched {} for task {} (pid {:?}, health port {})",
            self.program,
            task.id,
            child.id(),
            port
        );
        Ok(Box::new(ProcessWorker {
            child,
            health_url: format!("http://127.0.0.1:{}/health", port),
            client: self.client.clone(),
            timeout: self.probe_timeout,
        }))
    }
}

struct ProcessWorker {
    child: Child,
    health_url: String,
    client: reqwest::Client,
    timeout: Duration,
}

#[derive(Deserialize)]
struct HealthBody {
    status: String,
}

#[async_trait]
impl Worker for ProcessWorker {
    async fn probe(&mut self) -> HealthStatus {
        let response = match self
            .client
            .get(&self.health_url)
            .timeout(self.timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => return HealthStatus::unhealthy(format!("probe failed: {}", e)),
        };
        if !response.status().is_success() {
            return HealthStatus::unhealthy(format!("health returned {}", response.status()));
        }
        match response.json::<HealthBody>().await {
            Ok(body) if matches!(body.status.as_str(), "ok" | "healthy") => {
                HealthStatus::healthy(body.status)
            }
            Ok(body) => HealthStatus::unhealthy(format!("status {}", body.status)),
            Err(e) => HealthStatus::unhealthy(format!("invalid health body: {}", e)),
        }
    }

    fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }

    async fn stop(&mut self) -> Result<()> {
        if self.has_exited() {
            return Ok(());
        }
        self.child.kill().await?;
        Ok(())
    }
}

/// Launcher for in-process simulation: workers report whatever the shared
/// flag says. Used by `--memory` mode and tests.
#[derive(Debug, Clone)]
pub struct SimulatedLauncher {
    healthy: Arc<AtomicBool>,
    launched: Arc<AtomicUsize>,
}

impl Default for SimulatedLauncher {
    fn default() -> Self {
        Self {
            healthy: Arc::new(AtomicBool::new(true)),
            launched: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl SimulatedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Launcher for SimulatedLauncher {
    async fn launch(&self, task: &Task) -> Result<Box<dyn Worker>> {
        self.launched.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("Simulated worker started for {}", task.id);
        Ok(Box::new(SimulatedWorker {
            healthy: self.healthy.clone(),
            stopped: false,
        }))
    }
}

struct SimulatedWorker {
    healthy: Arc<AtomicBool>,
    stopped: bool,
}

#[async_trait]
impl Worker for SimulatedWorker {
    async fn probe(&mut self) -> HealthStatus {
        if self.healthy.load(Ordering::SeqCst) {
            HealthStatus::healthy("ok")
        } else {
            HealthStatus::unhealthy("simulated failure")
        }
    }

    fn has_exited(&mut self) -> bool {
        self.stopped
    }

    async fn stop(&mut self) -> Result<()> {
        self.stopped = true;
        Ok(())
    }
}
