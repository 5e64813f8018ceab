//! CLI for swarm operations

use chrono::Utc;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use swarmlease::common::{init_tracing, short_id, Config, SystemClock};
use swarmlease::coordination::{ContentOutcome, GeographicRouter};
use swarmlease::model::{Assignments, ContentList, RegionalPolicy, Roster, Schedule, Task};
use swarmlease::ops::{GovernorOutcome, Governor, Healer};
use swarmlease::store::{
    compare_and_write, read_document, CoordinationStore, GitStore, GitStoreConfig, Mutation,
    WriteOutcome,
};

#[derive(Parser)]
#[command(name = "swarmlease")]
#[command(about = "swarmlease operator CLI")]
#[command(version)]
struct Cli {
    /// Working copy of the coordination repository
    #[arg(long, default_value = "./coord-repo")]
    repo: PathBuf,

    #[arg(long, default_value = "origin")]
    remote: String,

    #[arg(long, default_value = "main")]
    branch: String,

    /// Config file (defaults to ./swarmlease.toml when present)
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show nodes, tasks and who holds them
    Status,

    /// Create the schedule with the healer and governor tasks if missing
    Init,

    /// Run one healer pass
    Heal {
        /// Show what would change without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Run one governor pass
    Govern {
        /// Show what would change without writing
        #[arg(long)]
        dry_run: bool,
    },

    /// Drop the assignment of a task so another node can claim it
    Release {
        task_id: String,
    },

    /// Add an item to the shared content list
    AddItem {
        item: String,

        /// Region the edit is made from
        #[arg(long)]
        region: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    init_tracing(&config.log_level);

    let mut git = GitStoreConfig::new(&cli.repo);
    git.remote = cli.remote.clone();
    git.branch = cli.branch.clone();
    git.timeout = config.git_timeout();
    let store = GitStore::open(git)?;
    let store: &dyn CoordinationStore = &store;
    let policy = config.retry_policy();
    let clock = SystemClock;

    match cli.command {
        Commands::Status => {
            let now = Utc::now();
            let roster = read_document::<Roster>(store).await?.value;
            let schedule = read_document::<Schedule>(store).await?.value;
            let assignments = read_document::<Assignments>(store).await?.value;

            println!("Nodes ({}):", roster.len());
            for node in roster.nodes.values() {
                println!(
                    "  {}  {:<12} {:<6} last seen {}s ago  task: {}",
                    short_id(&node.id),
                    node.region,
                    node.state(now, config.node_timeout()),
                    (now - node.last_heartbeat).num_seconds(),
                    node.current_task.as_deref().unwrap_or("-")
                );
            }
            println!("Schedule v{} ({} tasks):", schedule.version, schedule.tasks.len());
            for task in schedule.ordered() {
                let holder = match assignments.get(&task.id) {
                    Some(a) if a.is_live(now) => format!(
                        "held by {} until {}",
                        short_id(&a.node_id),
                        a.lease_expires_at.format("%H:%M:%S")
                    ),
                    Some(a) => format!("orphaned (was {})", short_id(&a.node_id)),
                    None => "unassigned".to_string(),
                };
                println!(
                    "  [{}] {:<24} {:<9} {}",
                    task.priority,
                    task.id,
                    task.type_name(),
                    holder
                );
            }
        }

        Commands::Init => {
            let outcome = compare_and_write::<Schedule, _>(store, &policy, |schedule| {
                let mut changed = false;
                for task in [Task::healer(60), Task::governor(300)] {
                    if !schedule.contains(&task.id) {
                        schedule.tasks.push(task);
                        changed = true;
                    }
                }
                if changed {
                    schedule.version += 1;
                    Mutation::Changed("chore(schedule): add healer and governor".into())
                } else {
                    Mutation::Unchanged
                }
            })
            .await?;
            println!(
                "{}",
                if outcome.is_written() {
                    "Schedule initialized"
                } else {
                    "Schedule already has healer and governor"
                }
            );
        }

        Commands::Heal { dry_run } => {
            let healer = Healer::new(config.node_timeout());
            if dry_run {
                let plan = healer.preview(store, &clock).await?;
                println!("Heal plan:");
                println!("  Nodes to evict: {:?}", plan.evicted_nodes);
                for cleared in &plan.cleared {
                    println!(
                        "  Clear {} from {} ({})",
                        cleared.task_id,
                        short_id(&cleared.node_id),
                        cleared.reason
                    );
                }
            } else {
                let report = healer.run(store, &policy, &clock).await?;
                println!("Heal report:");
                println!("  Nodes evicted: {}", report.nodes_evicted);
                println!("  Assignments cleared: {}", report.assignments_cleared);
                println!("  Published: {}", report.published);
            }
        }

        Commands::Govern { dry_run } => {
            let router = Arc::new(router_for(&config, store, None).await?);
            let governor = Governor::new(config.node_timeout(), router);
            let (evaluations, applied, sharded) = if dry_run {
                let plan = governor.preview(store, &clock).await?;
                let current = read_document::<Schedule>(store).await?.value;
                println!("Governor plan (changes schedule: {}):", plan.changes(&current));
                (plan.evaluations, plan.applied, plan.sharded)
            } else {
                let report = governor.run(store, &policy, &clock).await?;
                match report.outcome {
                    GovernorOutcome::Published { version } => {
                        println!("Governor published schedule v{}", version)
                    }
                    GovernorOutcome::NoChange => println!("Governor: no change"),
                    GovernorOutcome::Deferred { needed, alive } => println!(
                        "Governor deferred: {} node(s) alive, {} needed",
                        alive, needed
                    ),
                }
                (report.evaluations, report.applied, report.sharded)
            };
            for evaluation in &evaluations {
                println!("  {:<24} {:?}", evaluation.trigger_id, evaluation.status);
            }
            println!("  Applied: {:?}", applied);
            println!("  Sharded: {:?}", sharded);
        }

        Commands::Release { task_id } => {
            let id = task_id.clone();
            let outcome = compare_and_write::<Assignments, _>(store, &policy, move |doc| {
                match doc.remove(&id) {
                    Some(_) => {
                        Mutation::Changed(format!("chore(assignments): operator releases {}", id))
                    }
                    None => Mutation::Unchanged,
                }
            })
            .await?;
            match outcome {
                WriteOutcome::Written { .. } => println!("Released {}", task_id),
                _ => println!("{} was not assigned", task_id),
            }
        }

        Commands::AddItem { item, region } => {
            let router = router_for(&config, store, region.as_deref()).await?;
            let update = ContentList {
                items: vec![item.clone()],
                ..Default::default()
            };
            let alive = read_document::<Roster>(store)
                .await?
                .value
                .alive_count(Utc::now(), config.node_timeout());
            let outcome = router
                .publish_content(
                    store,
                    &policy,
                    &update,
                    &format!("feat(shortlist): add {} from {}", item, router.region()),
                    alive,
                )
                .await?;
            match outcome {
                ContentOutcome::Written { items } => println!("Added {} ({} items)", item, items),
                ContentOutcome::Unchanged => println!("{} already listed", item),
                ContentOutcome::Deferred { needed, alive } => println!(
                    "Not added: {} node(s) alive, content writes need {}",
                    alive, needed
                ),
            }
        }
    }

    Ok(())
}

async fn router_for(
    config: &Config,
    store: &dyn CoordinationStore,
    region: Option<&str>,
) -> anyhow::Result<GeographicRouter> {
    let policy = match config.resolve_geo_policy_path() {
        Some(path) => RegionalPolicy::load_from_file(&path)?,
        None => read_document::<RegionalPolicy>(store).await?.value,
    };
    let region = GeographicRouter::detect_region(
        config.resolve_region(region).as_deref(),
        None,
        Some(&policy),
    );
    Ok(GeographicRouter::new(region, policy, config.geo.enabled))
}
