//! Node wiring: identity, shared context and the top-level run loop

use crate::common::{short_id, Clock, Config, Result};
use crate::coordination::{GeographicRouter, LeaseConfig, RoleSet};
use crate::model::NodeId;
use crate::node::heartbeat::{send_heartbeat, spawn_heartbeat, HostMetrics};
use crate::node::state_machine::NodeStateMachine;
use crate::node::worker::LauncherRegistry;
use crate::node::writer::StoreWriter;
use crate::store::CoordinationStore;
use chrono::{DateTime, Utc};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const NODE_ID_FILE: &str = ".node_id";

#[derive(Debug, Clone, PartialEq)]
pub struct NodeIdentity {
    pub id: NodeId,
    pub region: String,
    pub roles: RoleSet,
    pub started_at: DateTime<Utc>,
}

impl NodeIdentity {
    /// Fresh UUID v4 identity.
    pub fn generate(region: impl Into<String>, roles: RoleSet, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            region: region.into(),
            roles,
            started_at: now,
        }
    }

    /// Re-use the id stored in `data_dir/.node_id`, or generate one and store it.
    pub async fn load_or_generate(
        data_dir: &Path,
        region: impl Into<String>,
        roles: RoleSet,
        now: DateTime<Utc>,
    ) -> Result<Self> {
        let path = data_dir.join(NODE_ID_FILE);
        let mut identity = Self::generate(region, roles, now);
        match tokio::fs::read_to_string(&path).await {
            Ok(stored) if !stored.trim().is_empty() => {
                identity.id = stored.trim().to_string();
                tracing::info!("Re-using node id {} from {}", identity.id, path.display());
            }
            Ok(_) => tokio::fs::write(&path, &identity.id).await?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(data_dir).await?;
                tokio::fs::write(&path, &identity.id).await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(identity)
    }
}

/// Everything a node needs, passed explicitly to each component.
#[derive(Clone)]
pub struct NodeContext {
    pub identity: NodeIdentity,
    pub config: Arc<Config>,
    /// Reads go straight to the store.
    pub store: Arc<dyn CoordinationStore>,
    /// Writes go through the node's single writer.
    pub writer: StoreWriter,
    pub clock: Arc<dyn Clock>,
    pub router: Arc<GeographicRouter>,
    pub launchers: Arc<LauncherRegistry>,
    pub lease: LeaseConfig,
}

impl NodeContext {
    /// Build the context and start the node's writer task.
    pub fn new(
        identity: NodeIdentity,
        config: Config,
        store: Arc<dyn CoordinationStore>,
        clock: Arc<dyn Clock>,
        router: GeographicRouter,
        launchers: LauncherRegistry,
    ) -> (Self, JoinHandle<()>) {
        let (writer, handle) = StoreWriter::spawn(store.clone(), config.retry_policy());
        let lease = config.lease_config();
        let ctx = Self {
            identity,
            config: Arc::new(config),
            store,
            writer,
            clock,
            router: Arc::new(router),
            launchers: Arc::new(launchers),
            lease,
        };
        (ctx, handle)
    }

    pub fn short_id(&self) -> &str {
        short_id(&self.identity.id)
    }
}

/// Run a node until `shutdown` flips to true: announce it in the roster,
/// keep heartbeating, and drive the state machine. On shutdown the held
/// lease is released within the configured grace window.
pub async fn run_node(ctx: NodeContext, shutdown: watch::Receiver<bool>) -> Result<()> {
    tracing::info!(
        "Node {} starting (region {}, roles {}, store {})",
        ctx.identity.id,
        ctx.identity.region,
        ctx.identity.roles,
        ctx.store.name()
    );

    // announce before claiming anything so the healer sees us as alive
    if let Err(e) = send_heartbeat(&ctx, HostMetrics::new().sample(), None).await {
        tracing::warn!("Initial heartbeat failed: {}", e);
    }

    let machine = NodeStateMachine::new(ctx.clone());
    let heartbeat = spawn_heartbeat(ctx.clone(), machine.current_task(), shutdown.clone());

    machine.run(shutdown).await;

    if let Err(e) = heartbeat.await {
        tracing::warn!("Heartbeat task ended abnormally: {}", e);
    }
    tracing::info!("Node {} stopped", ctx.short_id());
    Ok(())
}
