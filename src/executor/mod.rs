//! Sequential, resumable execution of one feature's units.
//!
//! The executor walks the resolved order one unit at a time. For each unit it
//! consults the checkpoint, invokes the worker under a timeout, gates the
//! reported file changes through the Scope Guard and the Constraint
//! Evaluator, and records the outcome. After every terminal unit outcome the
//! checkpoint is saved *before* the evidence event is appended: a crash after
//! the save resumes cleanly, a crash before it only repeats that unit.

mod runner;
mod worker;

pub use runner::Executor;
pub use worker::{CommandWorker, Worker, WorkerOutput};

use crate::constraints::Severity;
use crate::manifest::UnitStatus;
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::Duration;

/// Knobs for one run.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Failures allowed per unit before it is blocked
    pub max_retries: u32,
    /// Upper bound on one worker invocation
    pub unit_timeout: Duration,
    /// Paths tolerated outside a unit's declared scope
    pub allowlist: Vec<String>,
    /// Phase name passed to the Constraint Evaluator
    pub phase: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            unit_timeout: Duration::from_secs(30 * 60),
            allowlist: Vec::new(),
            phase: "implement".to_string(),
        }
    }
}

/// Progress events for UIs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UnitEvent {
    RunStarted {
        run_id: String,
        total: usize,
        resumed: bool,
    },
    UnitSkipped {
        unit: String,
    },
    UnitStarted {
        unit: String,
        attempt: u32,
    },
    UnitCompleted {
        unit: String,
        attempt: u32,
        warnings: Vec<String>,
    },
    UnitFailed {
        unit: String,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    UnitBlocked {
        unit: String,
        dependents: Vec<String>,
    },
    RunFinished {
        outcome: RunOutcome,
    },
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every unit in the order is done.
    Completed,
    /// A unit exhausted its retries (or was already blocked).
    Halted { unit: String },
    /// An `escalate`/`halt` constraint matched.
    Stopped {
        unit: String,
        rule: String,
        severity: Severity,
    },
    /// Cancellation was observed between units or attempts.
    Cancelled,
}

impl RunOutcome {
    /// Exit code for the CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed => 0,
            RunOutcome::Halted { .. } => 1,
            RunOutcome::Stopped { .. } => 2,
            RunOutcome::Cancelled => 130,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

/// What happened to one unit executed in this invocation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitResult {
    pub unit: String,
    pub status: UnitStatus,
    pub attempts: u32,
    pub touched_files: Vec<String>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl UnitResult {
    fn new(unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            status: UnitStatus::Running,
            attempts: 0,
            touched_files: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub outcome: RunOutcome,
    /// Units that ran at least one attempt in this invocation
    pub executed: Vec<String>,
    /// Units skipped because the checkpoint had them done
    pub skipped: Vec<String>,
    pub results: Vec<UnitResult>,
    /// Final status of every unit in the order
    pub statuses: BTreeMap<String, UnitStatus>,
    #[serde(rename = "duration_ms", serialize_with = "serialize_millis")]
    pub duration: Duration,
}

fn serialize_millis<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(duration.as_millis() as u64)
}

impl RunReport {
    pub fn result(&self, unit: &str) -> Option<&UnitResult> {
        self.results.iter().find(|r| r.unit == unit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outcome_exit_codes() {
        assert_eq!(RunOutcome::Completed.exit_code(), 0);
        assert_eq!(RunOutcome::Halted { unit: "A".into() }.exit_code(), 1);
        assert_eq!(
            RunOutcome::Stopped {
                unit: "A".into(),
                rule: "r".into(),
                severity: Severity::Halt
            }
            .exit_code(),
            2
        );
        assert_eq!(RunOutcome::Cancelled.exit_code(), 130);
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = UnitEvent::UnitStarted {
            unit: "WS-01".into(),
            attempt: 1,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "unit_started");
        assert_eq!(value["unit"], "WS-01");
    }
}
