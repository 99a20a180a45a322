use super::Severity;
use crate::errors::ConductorError;
use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Phase name that makes a rule apply in every phase.
pub const WILDCARD_PHASE: &str = "*";

/// What kind of action a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleTarget {
    /// `pattern` is a regex searched in the command string.
    Command,
    /// `pattern` is a glob matched against the repo-relative path.
    Path,
}

/// One rule as written in the rules file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintRule {
    pub id: String,
    #[serde(default = "default_phases")]
    pub phases: Vec<String>,
    pub target: RuleTarget,
    pub pattern: String,
    pub severity: Severity,
    #[serde(default)]
    pub message: String,
}

fn default_phases() -> Vec<String> {
    vec![WILDCARD_PHASE.to_string()]
}

impl ConstraintRule {
    pub fn applies_to_phase(&self, phase: &str) -> bool {
        self.phases
            .iter()
            .any(|p| p == WILDCARD_PHASE || p == phase)
    }
}

/// Top-level shape of `rules.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulesFile {
    #[serde(default)]
    pub rules: Vec<ConstraintRule>,
}

#[derive(Debug, Clone)]
pub(super) enum Matcher {
    Command(Regex),
    Path(glob::Pattern),
}

#[derive(Debug, Clone)]
pub(super) struct CompiledRule {
    pub(super) rule: ConstraintRule,
    pub(super) matcher: Matcher,
}

/// Rules with their patterns compiled. Immutable once built.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    pub(super) rules: Vec<CompiledRule>,
}

impl RuleSet {
    /// The empty set: every action proceeds.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile every rule, failing on the first invalid pattern.
    pub fn compile(rules: Vec<ConstraintRule>) -> Result<Self, ConductorError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let matcher = match rule.target {
                RuleTarget::Command => Matcher::Command(Regex::new(&rule.pattern).map_err(|e| {
                    ConductorError::InvalidPattern {
                        pattern: rule.pattern.clone(),
                        message: format!("rule '{}': {}", rule.id, e),
                    }
                })?),
                RuleTarget::Path => {
                    Matcher::Path(glob::Pattern::new(&rule.pattern).map_err(|e| {
                        ConductorError::InvalidPattern {
                            pattern: rule.pattern.clone(),
                            message: format!("rule '{}': {}", rule.id, e),
                        }
                    })?)
                }
            };
            compiled.push(CompiledRule { rule, matcher });
        }
        Ok(Self { rules: compiled })
    }

    /// Parse and compile a `rules.toml` document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let file: RulesFile = toml::from_str(content).context("Failed to parse rules file")?;
        Ok(Self::compile(file.rules)?)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> impl Iterator<Item = &ConstraintRule> {
        self.rules.iter().map(|c| &c.rule)
    }
}

/// Where the active rules came from.
///
/// A missing rules file is not an error: evaluation fails open with no
/// constraints, and callers must surface [`RuleSource::Missing`] to the
/// user rather than hide it.
#[derive(Debug, Clone)]
pub enum RuleSource {
    Loaded { path: PathBuf, rules: RuleSet },
    Missing { path: PathBuf },
}

impl RuleSource {
    /// Load rules from `path`. A file that exists but does not parse is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!(
                path = %path.display(),
                "no constraint rules found; evaluating with no constraints"
            );
            return Ok(RuleSource::Missing {
                path: path.to_path_buf(),
            });
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read rules file {}", path.display()))?;
        let rules = RuleSet::from_toml(&content)
            .with_context(|| format!("Invalid rules file {}", path.display()))?;
        tracing::debug!(path = %path.display(), rules = rules.len(), "constraint rules loaded");
        Ok(RuleSource::Loaded {
            path: path.to_path_buf(),
            rules,
        })
    }

    /// The active rules; empty when the file was missing.
    pub fn rules(&self) -> RuleSet {
        match self {
            RuleSource::Loaded { rules, .. } => rules.clone(),
            RuleSource::Missing { .. } => RuleSet::empty(),
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, RuleSource::Missing { .. })
    }

    pub fn path(&self) -> &Path {
        match self {
            RuleSource::Loaded { path, .. } | RuleSource::Missing { path } => path,
        }
    }

    /// One-line description for CLI output.
    pub fn describe(&self) -> String {
        match self {
            RuleSource::Loaded { path, rules } => {
                format!("{} rule(s) from {}", rules.len(), path.display())
            }
            RuleSource::Missing { path } => format!(
                "no rules file at {}; running with NO constraints (fail-open)",
                path.display()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const RULES: &str = r#"
[[rules]]
id = "no-force-push"
target = "command"
pattern = 'git\s+push\s+.*--force'
severity = "halt"
message = "force pushes are forbidden"

[[rules]]
id = "lockfile"
phases = ["implement", "review"]
target = "path"
pattern = "**/Cargo.lock"
severity = "warn"
"#;

    #[test]
    fn test_parse_rules_file() {
        let set = RuleSet::from_toml(RULES).unwrap();
        assert_eq!(set.len(), 2);
        let rules: Vec<_> = set.rules().collect();
        assert_eq!(rules[0].phases, vec!["*"]);
        assert_eq!(rules[0].severity, Severity::Halt);
        assert_eq!(rules[1].target, RuleTarget::Path);
        assert!(rules[1].message.is_empty());
    }

    #[test]
    fn test_phase_applicability() {
        let set = RuleSet::from_toml(RULES).unwrap();
        let rules: Vec<_> = set.rules().collect();
        assert!(rules[0].applies_to_phase("anything"));
        assert!(rules[1].applies_to_phase("review"));
        assert!(!rules[1].applies_to_phase("plan"));
    }

    #[test]
    fn test_invalid_regex_names_rule() {
        let err = RuleSet::compile(vec![ConstraintRule {
            id: "bad".into(),
            phases: default_phases(),
            target: RuleTarget::Command,
            pattern: "(unclosed".into(),
            severity: Severity::Block,
            message: String::new(),
        }])
        .unwrap_err();
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn test_invalid_glob_rejected() {
        let toml = r#"
[[rules]]
id = "g"
target = "path"
pattern = "[unclosed"
severity = "block"
"#;
        assert!(RuleSet::from_toml(toml).is_err());
    }

    #[test]
    fn test_missing_rules_file_fails_open_visibly() {
        let dir = TempDir::new().unwrap();
        let source = RuleSource::load(&dir.path().join("rules.toml")).unwrap();
        assert!(source.is_missing());
        assert!(source.rules().is_empty());
        assert!(source.describe().contains("NO constraints"));
    }

    #[test]
    fn test_malformed_rules_file_is_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.toml");
        fs::write(&path, "[[rules]]\nid = ").unwrap();
        let err = RuleSource::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("rules.toml"));
    }

    #[test]
    fn test_load_existing_rules_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rules.toml");
        fs::write(&path, RULES).unwrap();
        let source = RuleSource::load(&path).unwrap();
        assert!(!source.is_missing());
        assert_eq!(source.rules().len(), 2);
        assert!(source.describe().starts_with("2 rule(s)"));
    }
}
