//! Common utilities and types shared across swarmlease

pub mod clock;
pub mod config;
pub mod error;
pub mod hash;
pub mod retry;
pub mod telemetry;
pub mod utils;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{Error, Result};
pub use hash::{blake3_hash, json_digest, short_digest};
pub use retry::RetryPolicy;
pub use telemetry::init_tracing;
pub use utils::{parse_duration, short_id, to_chrono, until, NodeState};
