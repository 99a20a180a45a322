//! Append-only, hash-chained evidence log.
//!
//! Every event stores the hash of its predecessor (`prev_hash`) and a hash
//! over its own canonical content `{type, payload, timestamp, prev_hash}`.
//! Recomputing the chain detects truncated writes, reordered events and any
//! single altered field. It does not stop someone with write access from
//! regenerating the whole chain from a tampering point forward; nothing
//! external anchors a prefix.

mod log;
mod store;

pub use log::EvidenceLog;
pub use store::{EvidenceStore, JsonlEvidenceStore, MemoryEvidenceStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// `prev_hash` of the first event in every chain.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Event type names written by the executor.
pub mod event_types {
    pub const RUN_STARTED: &str = "run_started";
    pub const RUN_RESUMED: &str = "run_resumed";
    pub const UNIT_COMPLETED: &str = "unit_completed";
    pub const UNIT_FAILED: &str = "unit_failed";
    pub const SCOPE_VIOLATION: &str = "scope_violation";
    pub const CONSTRAINT_WARNING: &str = "constraint_warning";
    pub const CONSTRAINT_BLOCKED: &str = "constraint_blocked";
    pub const UNIT_BLOCKED: &str = "unit_blocked";
    pub const RUN_HALTED: &str = "run_halted";
    pub const RUN_CANCELLED: &str = "run_cancelled";
    pub const RUN_COMPLETED: &str = "run_completed";
}

/// One hash-linked record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub prev_hash: String,
    pub hash: String,
}

/// The hashed portion of an event, in canonical field order.
#[derive(Serialize)]
struct CanonicalContent<'a> {
    #[serde(rename = "type")]
    event_type: &'a str,
    payload: &'a serde_json::Value,
    timestamp: &'a DateTime<Utc>,
    prev_hash: &'a str,
}

impl EvidenceEvent {
    /// Build an event linked to `prev_hash` and seal it with its hash.
    pub fn new(
        event_type: &str,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
        prev_hash: &str,
    ) -> Self {
        let hash = compute_hash(event_type, &payload, &timestamp, prev_hash);
        Self {
            event_type: event_type.to_string(),
            payload,
            timestamp,
            prev_hash: prev_hash.to_string(),
            hash,
        }
    }

    /// Hash this event's content as it is now.
    pub fn recompute_hash(&self) -> String {
        compute_hash(
            &self.event_type,
            &self.payload,
            &self.timestamp,
            &self.prev_hash,
        )
    }
}

/// Lowercase hex SHA-256 over the canonical JSON content.
pub fn compute_hash(
    event_type: &str,
    payload: &serde_json::Value,
    timestamp: &DateTime<Utc>,
    prev_hash: &str,
) -> String {
    let content = CanonicalContent {
        event_type,
        payload,
        timestamp,
        prev_hash,
    };
    // Serializing borrowed strings and a Value cannot fail
    let bytes = serde_json::to_vec(&content).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    format!("{:x}", hasher.finalize())
}

/// Outcome of walking a chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChainReport {
    pub valid: bool,
    pub events: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_bad_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ChainReport {
    pub fn ok(events: usize) -> Self {
        Self {
            valid: true,
            events,
            first_bad_index: None,
            reason: None,
        }
    }

    pub fn broken(events: usize, index: usize, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            events,
            first_bad_index: Some(index),
            reason: Some(reason.into()),
        }
    }
}

/// Walk from index 0 checking each link and each recomputed hash.
///
/// Returns the first index whose `prev_hash` does not match its
/// predecessor's hash, or whose stored hash does not match its content.
pub fn verify_chain(events: &[EvidenceEvent]) -> ChainReport {
    let mut expected_prev = GENESIS_HASH;

    for (index, event) in events.iter().enumerate() {
        if event.prev_hash != expected_prev {
            return ChainReport::broken(
                events.len(),
                index,
                format!(
                    "prev_hash {} does not match hash of previous event {}",
                    short(&event.prev_hash),
                    short(expected_prev)
                ),
            );
        }
        let recomputed = event.recompute_hash();
        if recomputed != event.hash {
            return ChainReport::broken(
                events.len(),
                index,
                format!(
                    "stored hash {} does not match content hash {}",
                    short(&event.hash),
                    short(&recomputed)
                ),
            );
        }
        expected_prev = &event.hash;
    }

    ChainReport::ok(events.len())
}

fn short(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
