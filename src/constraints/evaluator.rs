use super::Severity;
use super::rules::{Matcher, RuleSet};
use crate::errors::ConductorError;
use crate::scope::{PATH_MATCH_OPTIONS, normalize_path};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Something an agent is about to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "lowercase")]
pub enum Action {
    Command(String),
    Path(String),
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Command(c) => write!(f, "command `{c}`"),
            Action::Path(p) => write!(f, "path {p}"),
        }
    }
}

/// One matched rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub rule_id: String,
    pub severity: Severity,
    pub message: String,
}

impl Violation {
    pub fn into_error(self) -> ConductorError {
        ConductorError::ConstraintViolation {
            rule: self.rule_id,
            severity: self.severity,
            message: self.message,
        }
    }
}

/// Every rule applicable in `phase` whose predicate matches `action`.
///
/// Returns violations in rule order; all rules are evaluated.
pub fn evaluate(phase: &str, action: &Action, rules: &RuleSet) -> Vec<Violation> {
    let normalized_path = match action {
        Action::Path(p) => Some(normalize_path(p)),
        Action::Command(_) => None,
    };

    rules
        .rules
        .iter()
        .filter(|compiled| compiled.rule.applies_to_phase(phase))
        .filter(|compiled| match (&compiled.matcher, action, &normalized_path) {
            (Matcher::Command(re), Action::Command(cmd), _) => re.is_match(cmd),
            (Matcher::Path(pattern), Action::Path(_), Some(path)) => {
                pattern.matches_with(path, PATH_MATCH_OPTIONS)
            }
            _ => false,
        })
        .map(|compiled| {
            let message = if compiled.rule.message.is_empty() {
                format!("{} matched rule '{}'", action, compiled.rule.id)
            } else {
                compiled.rule.message.clone()
            };
            Violation {
                rule_id: compiled.rule.id.clone(),
                severity: compiled.rule.severity,
                message,
            }
        })
        .collect()
}
