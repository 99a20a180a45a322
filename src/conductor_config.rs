//! Layered configuration for conductor.
//!
//! Settings come from `.conductor/conductor.toml`, then environment
//! variables, then CLI flags, each layer overriding the previous one.
//!
//! # Configuration File Format
//!
//! ```toml
//! [project]
//! workstreams_dir = "docs/workstreams"
//!
//! [executor]
//! max_retries = 3
//! unit_timeout_secs = 1800
//! worker_cmd = "./scripts/build-unit.sh"
//! phase = "implement"
//!
//! [scope]
//! allowlist = ["Cargo.lock", "**/*.snap"]
//!
//! [constraints]
//! rules_file = ".conductor/rules.toml"
//!
//! [attestation]
//! dir = ".conductor/attestations"
//! report = true
//! ```
//!
//! Environment overrides: `CONDUCTOR_MAX_RETRIES`, `CONDUCTOR_UNIT_TIMEOUT`,
//! `CONDUCTOR_WORKER_CMD`, `CONDUCTOR_RULES`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the state directory inside the project.
pub const STATE_DIR: &str = ".conductor";
/// Config file name inside the state directory.
pub const CONFIG_FILE: &str = "conductor.toml";

pub const ENV_MAX_RETRIES: &str = "CONDUCTOR_MAX_RETRIES";
pub const ENV_UNIT_TIMEOUT: &str = "CONDUCTOR_UNIT_TIMEOUT";
pub const ENV_WORKER_CMD: &str = "CONDUCTOR_WORKER_CMD";
pub const ENV_RULES: &str = "CONDUCTOR_RULES";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSection {
    /// Directory holding workstream manifests, relative to the project
    #[serde(default = "default_workstreams_dir")]
    pub workstreams_dir: String,
}

impl Default for ProjectSection {
    fn default() -> Self {
        Self {
            workstreams_dir: default_workstreams_dir(),
        }
    }
}

fn default_workstreams_dir() -> String {
    "docs/workstreams".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorSection {
    /// Failures allowed per unit before it is blocked
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Timeout for one worker invocation
    #[serde(default = "default_unit_timeout_secs")]
    pub unit_timeout_secs: u64,
    /// Shell command run once per unit attempt
    #[serde(default)]
    pub worker_cmd: Option<String>,
    /// Phase name passed to constraint evaluation
    #[serde(default = "default_phase")]
    pub phase: String,
}

impl Default for ExecutorSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            unit_timeout_secs: default_unit_timeout_secs(),
            worker_cmd: None,
            phase: default_phase(),
        }
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_unit_timeout_secs() -> u64 {
    30 * 60
}

fn default_phase() -> String {
    "implement".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScopeSection {
    /// Paths tolerated outside every unit's declared scope
    #[serde(default)]
    pub allowlist: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConstraintsSection {
    #[serde(default = "default_rules_file")]
    pub rules_file: String,
}

impl Default for ConstraintsSection {
    fn default() -> Self {
        Self {
            rules_file: default_rules_file(),
        }
    }
}

fn default_rules_file() -> String {
    format!("{}/rules.toml", STATE_DIR)
}

/// Statements land in `dir` under a name unique to each statement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttestationSection {
    #[serde(default = "default_attestation_dir")]
    pub dir: String,
    /// Also write a markdown report next to each statement
    #[serde(default)]
    pub report: bool,
}

impl Default for AttestationSection {
    fn default() -> Self {
        Self {
            dir: default_attestation_dir(),
            report: false,
        }
    }
}

fn default_attestation_dir() -> String {
    format!("{}/attestations", STATE_DIR)
}

/// Contents of `conductor.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConductorToml {
    #[serde(default)]
    pub project: ProjectSection,
    #[serde(default)]
    pub executor: ExecutorSection,
    #[serde(default)]
    pub scope: ScopeSection,
    #[serde(default)]
    pub constraints: ConstraintsSection,
    #[serde(default)]
    pub attestation: AttestationSection,
}

impl ConductorToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse conductor.toml")
    }

    /// Load from `<state_dir>/conductor.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(state_dir: &Path) -> Result<Self> {
        let config_path = state_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize conductor.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.executor.max_retries == 0 {
            warnings.push("executor.max_retries is 0: every unit would be blocked".to_string());
        }
        if self.executor.unit_timeout_secs == 0 {
            warnings.push("executor.unit_timeout_secs is 0: every attempt would time out".to_string());
        }
        if self.executor.worker_cmd.as_deref().is_none_or(|c| c.trim().is_empty()) {
            warnings.push(format!(
                "executor.worker_cmd is not set; pass --worker-cmd or set {}",
                ENV_WORKER_CMD
            ));
        }
        for pattern in &self.scope.allowlist {
            if let Err(e) = glob::Pattern::new(pattern) {
                warnings.push(format!("Invalid allowlist pattern '{}': {}", pattern, e));
            }
        }

        warnings
    }
}

/// Read an env override, ignoring (and logging) values that don't parse.
fn env_parsed<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, value = %raw, "ignoring unparseable environment override");
            None
        }
    }
}

/// CLI-level overrides; `None` leaves the lower layers in effect.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub max_retries: Option<u32>,
    pub unit_timeout_secs: Option<u64>,
    pub worker_cmd: Option<String>,
    pub phase: Option<String>,
}

/// Configuration merged from file, environment and CLI.
#[derive(Debug, Clone)]
pub struct ConductorConfig {
    /// Path to the project directory
    pub project_dir: PathBuf,
    /// Path to the .conductor directory
    pub state_dir: PathBuf,
    /// Parsed conductor.toml
    pub toml: ConductorToml,
    pub cli: CliOverrides,
}

impl ConductorConfig {
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let state_dir = project_dir.join(STATE_DIR);
        let toml = ConductorToml::load_or_default(&state_dir)?;

        Ok(Self {
            project_dir,
            state_dir,
            toml,
            cli: CliOverrides::default(),
        })
    }

    pub fn with_cli_overrides(mut self, cli: CliOverrides) -> Self {
        self.cli = cli;
        self
    }

    /// CLI → env → file.
    pub fn max_retries(&self) -> u32 {
        self.cli
            .max_retries
            .or_else(|| env_parsed(ENV_MAX_RETRIES))
            .unwrap_or(self.toml.executor.max_retries)
    }

    /// CLI → env → file.
    pub fn unit_timeout(&self) -> Duration {
        let secs = self
            .cli
            .unit_timeout_secs
            .or_else(|| env_parsed(ENV_UNIT_TIMEOUT))
            .unwrap_or(self.toml.executor.unit_timeout_secs);
        Duration::from_secs(secs)
    }

    /// CLI → env → file.
    pub fn worker_cmd(&self) -> Option<String> {
        self.cli
            .worker_cmd
            .clone()
            .or_else(|| std::env::var(ENV_WORKER_CMD).ok())
            .or_else(|| self.toml.executor.worker_cmd.clone())
            .filter(|c| !c.trim().is_empty())
    }

    pub fn phase(&self) -> String {
        self.cli
            .phase
            .clone()
            .unwrap_or_else(|| self.toml.executor.phase.clone())
    }

    pub fn allowlist(&self) -> &[String] {
        &self.toml.scope.allowlist
    }

    /// Env → file, relative paths resolved against the project directory.
    pub fn rules_file(&self) -> PathBuf {
        let raw = std::env::var(ENV_RULES)
            .unwrap_or_else(|_| self.toml.constraints.rules_file.clone());
        self.resolve(&raw)
    }

    pub fn workstreams_dir(&self) -> PathBuf {
        self.resolve(&self.toml.project.workstreams_dir)
    }

    pub fn attestation_dir(&self) -> PathBuf {
        self.resolve(&self.toml.attestation.dir)
    }

    pub fn attestation_report(&self) -> bool {
        self.toml.attestation.report
    }

    pub fn config_file(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.state_dir.join("checkpoints")
    }

    pub fn evidence_dir(&self) -> PathBuf {
        self.state_dir.join("evidence")
    }

    pub fn locks_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.state_dir.join("logs")
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.project_dir.join(p)
        }
    }

    /// Validate configuration and return warnings.
    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let toml = ConductorToml::default();
        assert_eq!(toml.project.workstreams_dir, "docs/workstreams");
        assert_eq!(toml.executor.max_retries, 3);
        assert_eq!(toml.executor.unit_timeout_secs, 1800);
        assert_eq!(toml.executor.phase, "implement");
        assert_eq!(toml.constraints.rules_file, ".conductor/rules.toml");
        assert!(toml.scope.allowlist.is_empty());
    }

    #[test]
    fn test_parse_full_file() {
        let content = r#"
[project]
workstreams_dir = "plans/ws"

[executor]
max_retries = 5
unit_timeout_secs = 60
worker_cmd = "make unit"

[scope]
allowlist = ["Cargo.lock"]

[attestation]
dir = "out/attestations"
report = true
"#;
        let toml = ConductorToml::parse(content).unwrap();
        assert_eq!(toml.project.workstreams_dir, "plans/ws");
        assert_eq!(toml.executor.max_retries, 5);
        assert_eq!(toml.executor.worker_cmd.as_deref(), Some("make unit"));
        assert_eq!(toml.scope.allowlist, vec!["Cargo.lock"]);
        assert_eq!(toml.attestation.dir, "out/attestations");
        assert!(toml.attestation.report);
        // Unspecified sections keep defaults
        assert_eq!(toml.constraints.rules_file, ".conductor/rules.toml");
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(ConductorToml::parse("[executor\nmax_retries = ").is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = ConductorToml::default();
        toml.executor.max_retries = 7;
        toml.save(&path).unwrap();
        assert_eq!(ConductorToml::load(&path).unwrap().executor.max_retries, 7);
    }

    #[test]
    fn test_validate_warnings() {
        let mut toml = ConductorToml::default();
        toml.executor.worker_cmd = Some("true".into());
        assert!(toml.validate().is_empty());

        toml.executor.max_retries = 0;
        toml.scope.allowlist.push("[bad".into());
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().any(|w| w.contains("[bad")));
    }

    #[test]
    fn test_layering_cli_over_env_over_file() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join(STATE_DIR)).unwrap();
        std::fs::write(
            dir.path().join(STATE_DIR).join(CONFIG_FILE),
            "[executor]\nmax_retries = 4\nworker_cmd = \"file-cmd\"\n",
        )
        .unwrap();

        let saved = std::env::var(ENV_MAX_RETRIES).ok();
        unsafe { std::env::remove_var(ENV_MAX_RETRIES) };

        let config = ConductorConfig::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(config.max_retries(), 4);

        unsafe { std::env::set_var(ENV_MAX_RETRIES, "6") };
        assert_eq!(config.max_retries(), 6);

        let config = config.with_cli_overrides(CliOverrides {
            max_retries: Some(9),
            ..Default::default()
        });
        assert_eq!(config.max_retries(), 9);

        unsafe { std::env::set_var(ENV_MAX_RETRIES, "not-a-number") };
        let config = ConductorConfig::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(config.max_retries(), 4);

        match saved {
            Some(val) => unsafe { std::env::set_var(ENV_MAX_RETRIES, val) },
            None => unsafe { std::env::remove_var(ENV_MAX_RETRIES) },
        }
    }

    #[test]
    fn test_paths_resolve_against_project_dir() {
        let _guard = ENV_MUTEX.lock().unwrap();
        let saved = std::env::var(ENV_RULES).ok();
        unsafe { std::env::remove_var(ENV_RULES) };

        let dir = TempDir::new().unwrap();
        let config = ConductorConfig::new(dir.path().to_path_buf()).unwrap();
        let root = dir.path().canonicalize().unwrap();
        assert_eq!(config.rules_file(), root.join(".conductor/rules.toml"));
        assert_eq!(config.workstreams_dir(), root.join("docs/workstreams"));
        assert_eq!(config.checkpoints_dir(), root.join(".conductor/checkpoints"));
        assert_eq!(config.attestation_dir(), root.join(".conductor/attestations"));
        assert!(!config.attestation_report());

        if let Some(val) = saved {
            unsafe { std::env::set_var(ENV_RULES, val) };
        }
    }
}
