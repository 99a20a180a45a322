//! `conductor init`: create the `.conductor/` state directory.
//!
//! ```text
//! .conductor/
//! ├── conductor.toml   # Configuration
//! ├── rules.toml       # Constraint rules
//! ├── checkpoints/     # One JSON checkpoint per run id
//! ├── evidence/        # One hash-chained JSONL log per run id
//! ├── locks/           # Advisory run locks
//! ├── logs/            # tracing file output
//! └── attestations/    # Attestation statements
//! ```

use crate::conductor_config::{CONFIG_FILE, ConductorToml, STATE_DIR};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

const SUBDIRS: &[&str] = &[
    "checkpoints",
    "evidence",
    "locks",
    "logs",
    "attestations",
];

const RULES_TEMPLATE: &str = r#"# Constraint rules evaluated against attempted actions.
#
# target   = "command" (regex over the command string) or "path" (glob over
#            the repo-relative path)
# phases   = phase names the rule applies in; "*" for all (default)
# severity = "warn" | "block" | "escalate" | "halt"

[[rules]]
id = "no-force-push"
phases = ["*"]
target = "command"
pattern = 'git\s+push\s+.*(--force|-f\b)'
severity = "halt"
message = "force pushes are forbidden"

[[rules]]
id = "no-env-files"
target = "path"
pattern = "**/.env*"
severity = "escalate"
message = "environment files may contain secrets"
"#;

/// Result of initializing a project.
#[derive(Debug)]
pub struct InitResult {
    /// Path to the .conductor directory
    pub state_dir: PathBuf,
    /// Whether the directory was newly created (false if it already existed)
    pub created: bool,
}

/// Create (or complete) the state directory. Existing files are left alone.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let state_dir = project_dir.join(STATE_DIR);
    let created = !state_dir.exists();

    std::fs::create_dir_all(&state_dir)
        .with_context(|| format!("Failed to create directory: {}", state_dir.display()))?;
    for sub in SUBDIRS {
        let dir = state_dir.join(sub);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }

    let config_file = state_dir.join(CONFIG_FILE);
    if !config_file.exists() {
        ConductorToml::default().save(&config_file)?;
    }

    let rules_file = state_dir.join("rules.toml");
    if !rules_file.exists() {
        std::fs::write(&rules_file, RULES_TEMPLATE)
            .with_context(|| format!("Failed to create {}", rules_file.display()))?;
    }

    Ok(InitResult { state_dir, created })
}

/// Check if a project has been initialized.
pub fn is_initialized(project_dir: &Path) -> bool {
    project_dir.join(STATE_DIR).join(CONFIG_FILE).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constraints::RuleSet;
    use tempfile::tempdir;

    #[test]
    fn test_init_creates_layout() {
        let dir = tempdir().unwrap();
        let result = init_project(dir.path()).unwrap();
        assert!(result.created);
        for sub in SUBDIRS {
            assert!(result.state_dir.join(sub).is_dir(), "missing {sub}");
        }
        assert!(is_initialized(dir.path()));
        ConductorToml::load(&result.state_dir.join(CONFIG_FILE)).unwrap();
    }

    #[test]
    fn test_rules_template_compiles() {
        let set = RuleSet::from_toml(RULES_TEMPLATE).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_init_is_idempotent_and_keeps_files() {
        let dir = tempdir().unwrap();
        init_project(dir.path()).unwrap();
        let rules = dir.path().join(STATE_DIR).join("rules.toml");
        std::fs::write(&rules, "# mine\n").unwrap();

        let again = init_project(dir.path()).unwrap();
        assert!(!again.created);
        assert_eq!(std::fs::read_to_string(&rules).unwrap(), "# mine\n");
    }

    #[test]
    fn test_not_initialized() {
        let dir = tempdir().unwrap();
        assert!(!is_initialized(dir.path()));
    }
}
