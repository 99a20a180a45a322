//! Durable run progress.
//!
//! A `Checkpoint` records which units of a run have completed, how many
//! times each unit has failed, and which units are blocked. The executor
//! saves it after every terminal unit outcome; resuming a run is reloading
//! the checkpoint and running again.

mod lock;
mod store;

pub use lock::RunLock;
pub use store::{CheckpointStore, FileCheckpointStore, MemoryCheckpointStore};
pub(crate) use store::file_stem_for;

use crate::manifest::UnitStatus;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Progress of one run, keyed by run/feature id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub run_id: String,
    /// Completed unit ids in completion order; never shrinks within a run
    #[serde(default)]
    pub completed: Vec<String>,
    /// Failure count per unit id
    #[serde(default)]
    pub retries: BTreeMap<String, u32>,
    /// Units that exhausted retries, plus their transitive dependents
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// An empty checkpoint for a run that has not started.
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            completed: Vec::new(),
            retries: BTreeMap::new(),
            blocked: Vec::new(),
            updated_at: Utc::now(),
        }
    }

    /// Whether nothing has been recorded yet.
    pub fn is_fresh(&self) -> bool {
        self.completed.is_empty() && self.retries.is_empty() && self.blocked.is_empty()
    }

    pub fn is_completed(&self, id: &str) -> bool {
        self.completed.iter().any(|c| c == id)
    }

    pub fn is_blocked(&self, id: &str) -> bool {
        self.blocked.iter().any(|b| b == id)
    }

    /// Record a completion. Idempotent.
    pub fn mark_completed(&mut self, id: &str) {
        if !self.is_completed(id) {
            self.completed.push(id.to_string());
        }
        self.touch();
    }

    /// Increment and return the failure count for `id`.
    pub fn record_failure(&mut self, id: &str) -> u32 {
        let count = self.retries.entry(id.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        self.touch();
        count
    }

    pub fn retries_for(&self, id: &str) -> u32 {
        self.retries.get(id).copied().unwrap_or(0)
    }

    /// Whether `id` has used up its attempts.
    pub fn is_exhausted(&self, id: &str, max_retries: u32) -> bool {
        self.retries_for(id) >= max_retries
    }

    /// Record units as blocked. Idempotent per id.
    pub fn mark_blocked<I, S>(&mut self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for id in ids {
            let id = id.as_ref();
            if !self.is_blocked(id) {
                self.blocked.push(id.to_string());
            }
        }
        self.touch();
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Status of `id` as far as this checkpoint knows.
    pub fn status_of(&self, id: &str) -> UnitStatus {
        if self.is_completed(id) {
            UnitStatus::Done
        } else if self.is_blocked(id) {
            UnitStatus::Blocked
        } else if self.retries_for(id) > 0 {
            UnitStatus::Failed
        } else {
            UnitStatus::Pending
        }
    }
}
