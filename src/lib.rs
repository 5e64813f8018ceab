//! # swarmlease
//!
//! Leaderless task coordination for a swarm of nodes that share nothing but
//! a git repository:
//! - Optimistic compare-and-swap on JSON documents (a rejected push is a lost race)
//! - Time-bounded leases with renewal, orphan reclaim and mutual exclusion
//! - Healer and Governor as ordinary, lease-protected tasks
//! - Trigger-driven schedule changes with quorum gates and task sharding
//! - Optional region-aware routing with per-class consistency and merges
//!
//! ## Architecture

#![allow(clippy::result_large_err)]
//!
//! ```text
//!   ┌──────────────────────── coordination repo ────────────────────────┐
//!   │ roster.json  schedule.json  assignments.json  triggers.json  ...  │
//!   └──────────▲──────────────────────▲──────────────────────▲──────────┘
//!              │ fetch / push          │                      │
//!   ┌──────────┴─────────┐  ┌──────────┴─────────┐  ┌─────────┴──────────┐
//!   │ Node A             │  │ Node B             │  │ Node C             │
//!   │  heartbeat loop    │  │  heartbeat loop    │  │  heartbeat loop    │
//!   │  state machine     │  │  state machine     │  │  state machine     │
//!   │  └ healer lease    │  │  └ worker: video   │  │  └ governor lease  │
//!   └────────────────────┘  └────────────────────┘  └────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Start a node
//! ```bash
//! swarmlease-node --repo ./coord-repo --roles system,web \
//!   --renderer text=./bin/text-renderer
//! ```
//!
//! ### Operator commands
//! ```bash
//! swarmlease --repo ./coord-repo status
//! swarmlease --repo ./coord-repo heal --dry-run
//! swarmlease --repo ./coord-repo govern
//! swarmlease --repo ./coord-repo release video-shard-2
//! ```

pub mod common;
pub mod coordination;
pub mod model;
pub mod node;
pub mod ops;
pub mod store;

// Re-export commonly used types
pub use common::{Config, Error, Result};
pub use node::{run_node, NodeContext, NodeIdentity};
pub use store::{CoordinationStore, GitStore, MemoryStore};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
