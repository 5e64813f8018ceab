//! Coordination primitives: leases, roles, conflict resolution and
//! region-aware routing

pub mod conflict;
pub mod geo;
pub mod lease;
pub mod roles;

pub use conflict::{
    merge_fields, merge_union, ConflictResolver, ConflictStrategy, ConflictedVersion,
    RegionPriorities, Resolution, StampedValue,
};
pub use geo::{ContentOutcome, GeographicRouter, WritePlan, DEFAULT_REGION};
pub use lease::{is_orphan, LeaseConfig};
pub use roles::{Role, RoleSet};
