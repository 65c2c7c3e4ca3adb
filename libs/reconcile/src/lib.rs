//! Reconciliation loop primitives.
//!
//! This library provides the process-lifetime building blocks a controller
//! needs to converge desired state without double-acting on its own
//! in-flight mutations:
//!
//! - **Expectations**: creates/deletes issued but not yet observed.
//! - **Requeue hints**: "reconcile me again in Δt" pushed by independent stages.
//! - **Backoff**: per-key exponential delay for hot-looping failures.
//! - **Slow start**: bounded fan-out whose batch size grows on success.
//!
//! # Invariants
//!
//! - Stores are explicitly constructed and injected; there are no globals
//! - All stores are safe to share across concurrently reconciling keys
//! - Revision hashes are deterministic given the same content

pub mod backoff;
pub mod expectations;
pub mod hints;
pub mod intstr;
pub mod slowstart;

use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub use backoff::Backoff;
pub use expectations::Expectations;
pub use hints::{DurationStore, Reduce, TimeStore};
pub use intstr::{clamp, IntOrPercent};
pub use slowstart::{slow_start_batch, BatchResult};

/// Reconciliation primitive errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconcileError {
    /// An int-or-percent value could not be interpreted.
    #[error("invalid int-or-percent value: {0}")]
    InvalidIntOrPercent(String),
}

/// Alphabet used to render revision hashes; avoids vowels and look-alikes so
/// generated names never spell words.
const SAFE_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";

/// Compute the name suffix for a revision of `data`.
///
/// The collision count is folded into the digest so that a name collision
/// with different content can be resolved by bumping the counter.
pub fn hash_revision(data: &serde_json::Value, collision_count: Option<i32>) -> String {
    let canonical = canonical_json(data);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    if let Some(count) = collision_count {
        hasher.update(count.to_le_bytes());
    }
    let result = hasher.finalize();
    let value = u32::from_be_bytes([result[0], result[1], result[2], result[3]]);
    safe_encode(&value.to_string())
}

fn safe_encode(s: &str) -> String {
    s.bytes()
        .map(|b| SAFE_ALPHABET[b as usize % SAFE_ALPHABET.len()] as char)
        .collect()
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
pub fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut pairs: Vec<_> = map.iter().collect();
            pairs.sort_by_key(|(k, _)| *k);
            let inner: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("\"{}\":{}", escape_json_string(k), canonical_json(v)))
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        serde_json::Value::String(s) => format!("\"{}\"", escape_json_string(s)),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Null => "null".to_string(),
    }
}

fn escape_json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Upper bound on concurrent mutations issued by one slow-start fan-out.
pub const BURST_REPLICAS: usize = 250;

/// First batch size used by slow-start fan-outs.
pub const SLOW_START_INITIAL_BATCH_SIZE: usize = 1;

/// How long an armed expectation is trusted before it is considered lost.
pub const DEFAULT_EXPECTATIONS_TTL: Duration = Duration::from_secs(5 * 60);

/// Failed-workload backoff seed.
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);

/// Failed-workload backoff ceiling.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(15 * 60);

/// How often stale backoff entries are swept.
pub const DEFAULT_BACKOFF_GC_INTERVAL: Duration = Duration::from_secs(60);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_revision_deterministic() {
        let json1 = serde_json::json!({"b": 2, "a": 1});
        let json2 = serde_json::json!({"a": 1, "b": 2});

        assert_eq!(hash_revision(&json1, None), hash_revision(&json2, None));
    }

    #[test]
    fn test_hash_revision_collision_count_changes_hash() {
        let json = serde_json::json!({"spec": {"template": {"$patch": "replace"}}});

        let h0 = hash_revision(&json, Some(0));
        let h1 = hash_revision(&json, Some(1));
        assert_ne!(h0, h1);
    }

    #[test]
    fn test_hash_revision_alphabet() {
        let json = serde_json::json!({"x": "y"});
        let hash = hash_revision(&json, None);

        assert!(!hash.is_empty());
        assert!(hash.bytes().all(|b| SAFE_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_canonical_json_escapes() {
        let json = serde_json::json!({"k": "a\"b\n"});
        assert_eq!(canonical_json(&json), r#"{"k":"a\"b\n"}"#);
    }
}
