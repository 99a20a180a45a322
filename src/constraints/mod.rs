//! Constraint evaluation for attempted actions.
//!
//! Rules are loaded once from a TOML file and compiled into a [`RuleSet`].
//! [`evaluate`] is a pure function of `(phase, action, rules)`: the current
//! phase is always passed in by the caller, never read from process state.
//! Callers fold the returned violations into an [`Outcome`].

mod evaluator;
mod rules;

pub use evaluator::{Action, Violation, evaluate};
pub use rules::{ConstraintRule, RuleSet, RuleSource, RuleTarget, RulesFile, WILDCARD_PHASE};

use serde::{Deserialize, Serialize};
use std::fmt;

/// How serious a matched rule is. Ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Allow and report.
    Warn,
    /// Reject this action; the session continues.
    Block,
    /// Stop the session and hand over to a human.
    Escalate,
    /// Stop the session.
    Halt,
}

impl Severity {
    /// Whether this severity ends the whole agent session.
    pub fn stops_session(self) -> bool {
        matches!(self, Severity::Escalate | Severity::Halt)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Warn => "warn",
            Severity::Block => "block",
            Severity::Escalate => "escalate",
            Severity::Halt => "halt",
        };
        f.write_str(s)
    }
}

/// Overall action derived from the most severe violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Proceed,
    Warn,
    Block,
    Stop,
}

impl Outcome {
    pub fn from_violations(violations: &[Violation]) -> Self {
        match violations.iter().map(|v| v.severity).max() {
            None => Outcome::Proceed,
            Some(Severity::Warn) => Outcome::Warn,
            Some(Severity::Block) => Outcome::Block,
            Some(Severity::Escalate | Severity::Halt) => Outcome::Stop,
        }
    }

    /// Process exit code for front ends: 0 allow, 1 reject, 2 stop session.
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Proceed | Outcome::Warn => 0,
            Outcome::Block => 1,
            Outcome::Stop => 2,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Proceed => "proceed",
            Outcome::Warn => "warn",
            Outcome::Block => "block",
            Outcome::Stop => "stop",
        };
        f.write_str(s)
    }
}
