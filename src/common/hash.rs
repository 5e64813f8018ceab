//! Hashing utilities for swarmlease
//!
//! - BLAKE3 content digests double as CAS tokens for stored documents
//! - Short digests identify conflicting versions and shard plans

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// First 16 hex chars of the BLAKE3 digest
pub fn short_digest(data: &[u8]) -> String {
    let mut full = blake3_hash(data);
    full.truncate(16);
    full
}

/// Digest of a JSON value in canonical form.
///
/// `serde_json::Value` objects are backed by a sorted map, so serializing
/// the value gives the same bytes regardless of the original key order.
pub fn json_digest(value: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    short_digest(&bytes)
}
