//! Reconciliation primitives.
//!
//! This library provides helpers for reconciliation loops that converge
//! the containers running on a node toward the pods desired for it:
//!
//! - **Spec hash**: a deterministic digest of the restart-relevant part of a
//!   container spec, compared against the digest stored on the running
//!   container.
//! - **Backoff**: per-key exponential backoff that throttles crash-looping
//!   workloads.
//! - **Clock**: an injectable time source so backoff and eviction decisions
//!   can be tested without the wall clock.
//!
//! # Invariants
//!
//! - Decisions are deterministic given the same inputs and the same `now`
//! - Spec hashes are independent of map key ordering

mod backoff;
mod clock;

use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;

pub use backoff::{Backoff, BackoffEntry, BackoffPolicy};
pub use clock::{Clock, ManualClock, SystemClock};

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// A stored spec hash could not be parsed.
    #[error("invalid spec hash: {0:?}")]
    InvalidSpecHash(String),
}

/// A spec hash for deterministic comparison.
///
/// Used to detect when a container's configuration has changed since the
/// container was created.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    const PREFIX: &'static str = "sha256:";

    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        Self(format!("{}{}", Self::PREFIX, hex::encode(&result[..16]))) // First 16 bytes (128 bits)
    }

    /// Parse a hash previously rendered with [`SpecHash::as_str`].
    ///
    /// Used for hashes read back from container labels, which may have been
    /// written by another agent version or tampered with.
    pub fn parse(s: &str) -> Result<Self, ReconcileError> {
        let Some(hex_part) = s.strip_prefix(Self::PREFIX) else {
            return Err(ReconcileError::InvalidSpecHash(s.to_string()));
        };
        if hex_part.len() != 32 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ReconcileError::InvalidSpecHash(s.to_string()));
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// Get the hash string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SpecHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
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

/// Default initial backoff after the first failed start.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(10);

/// Default backoff ceiling.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(300); // 5 minutes
