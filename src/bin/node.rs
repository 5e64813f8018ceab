//! Swarm node binary

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use swarmlease::common::{init_tracing, parse_duration, Clock, Config, SystemClock};
use swarmlease::coordination::{GeographicRouter, RoleSet};
use swarmlease::model::{RegionalPolicy, Schedule, Task};
use swarmlease::node::{LauncherRegistry, ProcessLauncher, SimulatedLauncher};
use swarmlease::store::{read_document, CoordinationStore, GitStore, GitStoreConfig, MemoryStore};
use swarmlease::{run_node, NodeContext, NodeIdentity};
use tokio::sync::watch;

#[derive(Parser)]
#[command(name = "swarmlease-node")]
#[command(about = "swarmlease node: claims and runs tasks from the shared schedule")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ./swarmlease.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Working copy of the coordination repository
    #[arg(long, default_value = "./coord-repo")]
    repo: PathBuf,

    /// Clone this URL into --repo when no working copy exists yet
    #[arg(long)]
    clone: Option<String>,

    #[arg(long, default_value = "origin")]
    remote: String,

    #[arg(long, default_value = "main")]
    branch: String,

    /// Run against an in-memory store instead of git
    #[arg(long)]
    memory: bool,

    /// Region this node runs in
    #[arg(long)]
    region: Option<String>,

    /// Turn region-aware routing on even if the policy leaves it off
    #[arg(long)]
    enable_geo_sharding: bool,

    /// Comma-separated roles (system, media, web, broadcaster); all when omitted
    #[arg(long)]
    roles: Option<String>,

    /// Lease TTL, e.g. "5m" or "300s"
    #[arg(long, value_parser = parse_ttl)]
    lease_ttl: Option<Duration>,

    /// External renderer: NAME=COMMAND [ARGS...]
    #[arg(long = "renderer", value_parser = parse_renderer)]
    renderers: Vec<(String, Vec<String>)>,

    /// Renderer served by an in-process simulated worker
    #[arg(long = "simulate")]
    simulated: Vec<String>,
}

fn parse_ttl(s: &str) -> Result<Duration, String> {
    parse_duration(s).map_err(|e| e.to_string())
}

fn parse_renderer(s: &str) -> Result<(String, Vec<String>), String> {
    let (name, command) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=COMMAND, got {}", s))?;
    let command: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    if name.is_empty() || command.is_empty() {
        return Err(format!("expected NAME=COMMAND, got {}", s));
    }
    Ok((name.to_string(), command))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(ttl) = cli.lease_ttl {
        config.lease.ttl_secs = ttl.as_secs();
        config.validate()?;
    }
    init_tracing(&config.log_level);

    let store: Arc<dyn CoordinationStore> = if cli.memory {
        let store = MemoryStore::new();
        store.seed(&Schedule {
            version: 1,
            tasks: vec![Task::healer(60), Task::governor(300)],
        })?;
        Arc::new(store)
    } else {
        let mut git = GitStoreConfig::new(&cli.repo);
        git.remote = cli.remote.clone();
        git.branch = cli.branch.clone();
        git.timeout = config.git_timeout();
        let store = match &cli.clone {
            Some(url) if !cli.repo.join(".git").exists() => GitStore::clone_from(url, git).await?,
            _ => GitStore::open(git)?,
        };
        store.ensure_branch().await?;
        Arc::new(store)
    };

    // policy file first, then the copy in the coordination repo
    let policy = match config.resolve_geo_policy_path() {
        Some(path) => RegionalPolicy::load_from_file(&path)?,
        None => read_document::<RegionalPolicy>(store.as_ref()).await?.value,
    };
    let region = GeographicRouter::detect_region(
        config.resolve_region(cli.region.as_deref()).as_deref(),
        None,
        Some(&policy),
    );
    let router = GeographicRouter::new(
        region.clone(),
        policy,
        cli.enable_geo_sharding || config.geo.enabled,
    );

    let roles = RoleSet::parse(cli.roles.as_deref().or(config.node.roles.as_deref()))?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let identity = if config.node.persist_node_id {
        NodeIdentity::load_or_generate(&config.node.data_dir, region, roles, clock.now()).await?
    } else {
        NodeIdentity::generate(region, roles, clock.now())
    };

    let mut launchers = LauncherRegistry::new();
    for (name, command) in &cli.renderers {
        let launcher = ProcessLauncher::new(&command[0])
            .with_args(command[1..].to_vec())
            .with_probe_timeout(config.health_probe_timeout());
        launchers.register(name.clone(), Arc::new(launcher));
    }
    for name in &cli.simulated {
        launchers.register(name.clone(), Arc::new(SimulatedLauncher::new()));
    }
    tracing::info!("Renderers: {:?}", launchers.renderers());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
        }
    });

    let (ctx, writer) = NodeContext::new(identity, config, store, clock, router, launchers);
    run_node(ctx, shutdown_rx).await?;
    writer.await?;
    Ok(())
}
