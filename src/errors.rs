//! Typed error hierarchy for the conductor core.
//!
//! `ConductorError` covers every failure the core can surface. Each variant
//! carries the locator (unit id, rule id, event index or path) so a fatal
//! condition is never reported without saying where it happened.

use crate::constraints::Severity;
use std::path::PathBuf;
use thiserror::Error;

/// Errors from manifest loading, resolution, execution and the stores.
#[derive(Debug, Error)]
pub enum ConductorError {
    #[error("Failed to parse manifest {path}: {message}")]
    ManifestParse { path: PathBuf, message: String },

    #[error("Duplicate unit id '{id}'")]
    DuplicateUnit { id: String },

    #[error("Cycle detected in unit dependencies. Unresolved units: {}", units.join(", "))]
    CycleDetected { units: Vec<String> },

    #[error("Unit '{unit}' depends on unknown unit '{dependency}'")]
    UnresolvedDependency { unit: String, dependency: String },

    #[error("Worker failed for unit '{unit}': {message}")]
    WorkerFailure { unit: String, message: String },

    #[error("Unit '{unit}' touched files outside its declared scope: {}", paths.join(", "))]
    ScopeViolation { unit: String, paths: Vec<String> },

    #[error("Constraint '{rule}' ({severity}) violated: {message}")]
    ConstraintViolation {
        rule: String,
        severity: Severity,
        message: String,
    },

    #[error("Evidence chain corrupted at event {index}: {reason}")]
    ChainCorruption { index: usize, reason: String },

    #[error("Store I/O failed for {path}: {source}")]
    StoreIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to (de)serialize {what}: {source}")]
    Serialization {
        what: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("Checkpoint {path} belongs to run '{found}', expected '{expected}'")]
    CheckpointMismatch {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("Run '{run_id}' is already held by another conductor process")]
    RunLocked { run_id: String },
}

impl ConductorError {
    /// Wrap an I/O error with the path it happened on.
    pub fn store_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::StoreIo {
            path: path.into(),
            source,
        }
    }

    /// Wrap a serde_json error with a short description of the payload.
    pub fn serialization(what: impl Into<String>, source: serde_json::Error) -> Self {
        Self::Serialization {
            what: what.into(),
            source,
        }
    }

    /// Whether this error aborts the whole run rather than one unit.
    ///
    /// Worker failures and scope violations are retried in place; everything
    /// else either has no valid continuation or risks losing durability.
    pub fn is_run_fatal(&self) -> bool {
        match self {
            Self::WorkerFailure { .. } | Self::ScopeViolation { .. } => false,
            Self::ManifestParse { .. } => false,
            Self::ConstraintViolation { severity, .. } => severity.stops_session(),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_error_names_every_unit() {
        let err = ConductorError::CycleDetected {
            units: vec!["A".to_string(), "B".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("A"));
        assert!(msg.contains("B"));
        assert!(msg.contains("Cycle"));
    }

    #[test]
    fn store_io_carries_path() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err = ConductorError::store_io("/tmp/run.json", io_err);
        match &err {
            ConductorError::StoreIo { path, source } => {
                assert_eq!(path, &PathBuf::from("/tmp/run.json"));
                assert_eq!(source.kind(), std::io::ErrorKind::PermissionDenied);
            }
            _ => panic!("Expected StoreIo"),
        }
        assert!(err.to_string().contains("/tmp/run.json"));
    }

    #[test]
    fn chain_corruption_names_index() {
        let err = ConductorError::ChainCorruption {
            index: 7,
            reason: "hash mismatch".to_string(),
        };
        assert!(err.to_string().contains("event 7"));
    }

    #[test]
    fn unit_local_failures_are_not_run_fatal() {
        let worker = ConductorError::WorkerFailure {
            unit: "WS-01".into(),
            message: "exit 1".into(),
        };
        let scope = ConductorError::ScopeViolation {
            unit: "WS-01".into(),
            paths: vec!["README.md".into()],
        };
        assert!(!worker.is_run_fatal());
        assert!(!scope.is_run_fatal());
    }

    #[test]
    fn constraint_fatality_follows_severity() {
        let block = ConductorError::ConstraintViolation {
            rule: "r1".into(),
            severity: Severity::Block,
            message: "no".into(),
        };
        let halt = ConductorError::ConstraintViolation {
            rule: "r2".into(),
            severity: Severity::Halt,
            message: "stop".into(),
        };
        assert!(!block.is_run_fatal());
        assert!(halt.is_run_fatal());
    }

    #[test]
    fn run_fatal_errors() {
        assert!(
            ConductorError::UnresolvedDependency {
                unit: "B".into(),
                dependency: "Z".into()
            }
            .is_run_fatal()
        );
        assert!(
            ConductorError::ChainCorruption {
                index: 0,
                reason: "x".into()
            }
            .is_run_fatal()
        );
    }

    #[test]
    fn all_errors_implement_std_error() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ConductorError::DuplicateUnit { id: "x".into() });
    }
}
