//! Utility functions for swarmlease

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::time::Duration;

/// Parse duration string (e.g., "30s", "5m", "1h", "7d")
pub fn parse_duration(s: &str) -> crate::Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(crate::Error::InvalidConfig("empty duration".into()));
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if s.chars().all(|c| c.is_ascii_digit()) {
        (s, "s")
    } else {
        let idx = s.char_indices().last().map(|(i, _)| i).unwrap_or(0);
        s.split_at(idx)
    };

    let num: u64 = num_str
        .parse()
        .map_err(|_| crate::Error::InvalidConfig(format!("invalid duration: {}", s)))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num * 60),
        "h" => Duration::from_secs(num * 3600),
        "d" => Duration::from_secs(num * 86400),
        _ => {
            return Err(crate::Error::InvalidConfig(format!(
                "unknown duration unit: {}",
                unit
            )))
        }
    };

    Ok(duration)
}

/// Convert a std duration into a chrono one, saturating on overflow.
pub fn to_chrono(d: Duration) -> ChronoDuration {
    ChronoDuration::from_std(d).unwrap_or(ChronoDuration::MAX)
}

/// Time left until `deadline`, zero if it already passed.
pub fn until(deadline: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (deadline - now).to_std().unwrap_or(Duration::ZERO)
}

/// Short form of a node id for log lines and commit messages.
pub fn short_id(id: &str) -> &str {
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Node health state, derived from the roster heartbeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Alive,
    Dead,
}

impl NodeState {
    /// Derive liveness from the last heartbeat.
    pub fn from_heartbeat(
        last_heartbeat: DateTime<Utc>,
        now: DateTime<Utc>,
        node_timeout: Duration,
    ) -> Self {
        if now - last_heartbeat < to_chrono(node_timeout) {
            NodeState::Alive
        } else {
            NodeState::Dead
        }
    }

    pub fn is_alive(&self) -> bool {
        matches!(self, NodeState::Alive)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Alive => f.pad("alive"),
            NodeState::Dead => f.pad("dead"),
        }
    }
}
