//! A swarm node: identity, heartbeats, the store writer and the lifecycle
//! state machine that claims and runs tasks.

pub mod heartbeat;
pub mod runtime;
pub mod state_machine;
pub mod worker;
pub mod writer;

pub use heartbeat::{send_heartbeat, spawn_heartbeat, HostMetrics};
pub use runtime::{run_node, NodeContext, NodeIdentity};
pub use state_machine::{select_candidate, ActiveWork, LifecycleState, NodeStateMachine};
pub use worker::{
    HealthMonitor, HealthStatus, Launcher, LauncherRegistry, ProcessLauncher, SimulatedLauncher,
    Verdict, Worker,
};
pub use writer::StoreWriter;
