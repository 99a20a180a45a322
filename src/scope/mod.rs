//! Scope Guard: checks changed paths against a unit's declared scope.
//!
//! Each path is classified, in order, as `in_scope` (matches a declared
//! implementation or test glob), `allowlisted` (matches the allowlist; kept as
//! a warning) or `violation`. The verdict passes iff there are no violations.

use crate::errors::ConductorError;
use crate::manifest::DeclaredScope;
use glob::{MatchOptions, Pattern};
use serde::Serialize;

/// Glob options for repo-relative paths.
///
/// `*` and `?` never cross a `/`; `**` spans directories. Matching is
/// case-sensitive and dot-files need no literal leading dot.
pub const PATH_MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// Normalise a path to repo-relative form with `/` separators.
pub fn normalize_path(path: &str) -> String {
    let mut p = path.replace('\\', "/");
    while let Some(rest) = p.strip_prefix("./") {
        p = rest.to_string();
    }
    p
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PathClass {
    InScope,
    Allowlisted,
    Violation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeEntry {
    pub path: String,
    pub class: PathClass,
}

/// Result of one verification. Never persisted beyond being logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopeVerdict {
    pub entries: Vec<ScopeEntry>,
    pub passed: bool,
    pub warnings: Vec<String>,
}

impl ScopeVerdict {
    pub fn violations(&self) -> Vec<&str> {
        self.paths_with(PathClass::Violation)
    }

    pub fn in_scope(&self) -> Vec<&str> {
        self.paths_with(PathClass::InScope)
    }

    fn paths_with(&self, class: PathClass) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|e| e.class == class)
            .map(|e| e.path.as_str())
            .collect()
    }

    /// `ScopeViolation` for `unit` if the verdict failed.
    pub fn into_result(self, unit: &str) -> Result<ScopeVerdict, ConductorError> {
        if self.passed {
            Ok(self)
        } else {
            Err(ConductorError::ScopeViolation {
                unit: unit.to_string(),
                paths: self.violations().into_iter().map(String::from).collect(),
            })
        }
    }
}

fn compile_patterns<'a>(
    patterns: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<Pattern>, ConductorError> {
    patterns
        .into_iter()
        .map(|p| {
            Pattern::new(&normalize_path(p)).map_err(|e| ConductorError::InvalidPattern {
                pattern: p.to_string(),
                message: e.to_string(),
            })
        })
        .collect()
}

/// A declared scope plus allowlist with every glob compiled once.
#[derive(Debug, Clone)]
pub struct ScopeGuard {
    declared: Vec<Pattern>,
    allowlist: Vec<Pattern>,
}

impl ScopeGuard {
    pub fn new(scope: &DeclaredScope, allowlist: &[String]) -> Result<Self, ConductorError> {
        Ok(Self {
            declared: compile_patterns(scope.patterns())?,
            allowlist: compile_patterns(allowlist.iter().map(String::as_str))?,
        })
    }

    pub fn classify(&self, path: &str) -> PathClass {
        let matches = |patterns: &[Pattern]| {
            patterns
                .iter()
                .any(|p| p.matches_with(path, PATH_MATCH_OPTIONS))
        };
        if matches(&self.declared) {
            PathClass::InScope
        } else if matches(&self.allowlist) {
            PathClass::Allowlisted
        } else {
            PathClass::Violation
        }
    }

    pub fn verify<S: AsRef<str>>(&self, changed: &[S]) -> ScopeVerdict {
        let mut entries = Vec::with_capacity(changed.len());
        let mut warnings = Vec::new();

        for raw in changed {
            let path = normalize_path(raw.as_ref());
            let class = self.classify(&path);
            if class == PathClass::Allowlisted {
                warnings.push(format!("{path} is outside the declared scope but allowlisted"));
            }
            entries.push(ScopeEntry { path, class });
        }

        let passed = entries.iter().all(|e| e.class != PathClass::Violation);
        ScopeVerdict {
            entries,
            passed,
            warnings,
        }
    }
}

/// Classify `changed` against `scope` and `allowlist`.
pub fn verify<S: AsRef<str>>(
    changed: &[S],
    scope: &DeclaredScope,
    allowlist: &[String],
) -> Result<ScopeVerdict, ConductorError> {
    let verdict = ScopeGuard::new(scope, allowlist)?.verify(changed);
    tracing::debug!(
        changed = changed.len(),
        violations = verdict.violations().len(),
        passed = verdict.passed,
        "scope verified"
    );
    Ok(verdict)
}
