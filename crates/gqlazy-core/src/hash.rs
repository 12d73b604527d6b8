//! SHA-256 helpers for aliases, variable names and document hashes.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hex-encoded SHA-256 of the given parts, separated so that `["ab", "c"]`
/// and `["a", "bc"]` hash differently.
pub fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hasher.update([0u8]);
        }
        hasher.update(part.as_bytes());
    }
    format!("{:x}", hasher.finalize())
}

/// First `len` hex characters of [`sha256_hex`].
pub fn short_hash(parts: &[&str], len: usize) -> String {
    let mut full = sha256_hex(parts);
    full.truncate(len.min(full.len()));
    full
}

/// Canonical JSON text: object keys in sorted order, no whitespace.
///
/// `serde_json::Map` is backed by a `BTreeMap`, so plain serialization is
/// already key-sorted.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}
