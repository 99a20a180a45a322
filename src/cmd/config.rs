//! Configuration view and validation commands: `conductor config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<i32> {
    use conductor::conductor_config::{
        CONFIG_FILE, ConductorConfig, ConductorToml, ENV_MAX_RETRIES, ENV_RULES, ENV_UNIT_TIMEOUT,
        ENV_WORKER_CMD, STATE_DIR,
    };

    let state_dir = project_dir.join(STATE_DIR);
    let config_path = state_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Conductor Configuration");
            println!("=======================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                ConductorToml::load(&config_path)?
            } else {
                println!("No conductor.toml found at {}", config_path.display());
                println!("Using default configuration:");
                ConductorToml::default()
            };
            println!();

            println!("[project]");
            println!("  workstreams_dir = \"{}\"", toml.project.workstreams_dir);
            println!();
            println!("[executor]");
            println!("  max_retries = {}", toml.executor.max_retries);
            println!("  unit_timeout_secs = {}", toml.executor.unit_timeout_secs);
            if let Some(cmd) = &toml.executor.worker_cmd {
                println!("  worker_cmd = \"{}\"", cmd);
            }
            println!("  phase = \"{}\"", toml.executor.phase);
            println!();
            if !toml.scope.allowlist.is_empty() {
                println!("[scope]");
                println!("  allowlist = {:?}", toml.scope.allowlist);
                println!();
            }
            println!("[constraints]");
            println!("  rules_file = \"{}\"", toml.constraints.rules_file);
            println!();
            println!("[attestation]");
            println!("  dir = \"{}\"", toml.attestation.dir);
            println!("  report = {}", toml.attestation.report);
            println!();

            println!("Effective values (with env overrides):");
            let config = ConductorConfig::new(project_dir.to_path_buf())?;
            println!("  max_retries = {}", config.max_retries());
            println!("  unit_timeout = {}s", config.unit_timeout().as_secs());
            println!(
                "  worker_cmd = {}",
                config
                    .worker_cmd()
                    .map_or_else(|| "(not set)".to_string(), |c| format!("\"{}\"", c))
            );
            println!("  rules_file = {}", config.rules_file().display());
            println!();
            println!(
                "Environment overrides: {}, {}, {}, {}",
                ENV_MAX_RETRIES, ENV_UNIT_TIMEOUT, ENV_WORKER_CMD, ENV_RULES
            );
            println!();
            if !config_path.exists() {
                println!("Run 'conductor config init' to create a conductor.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No conductor.toml found. Using defaults (valid).");
                return Ok(0);
            }

            let toml = ConductorToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("conductor.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(0);
            }

            if !state_dir.exists() {
                std::fs::create_dir_all(&state_dir)?;
            }

            ConductorToml::default().save(&config_path)?;

            println!("Created conductor.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [project] workstreams_dir");
            println!("  - [executor] worker_cmd, max_retries, unit_timeout_secs");
            println!("  - [scope] allowlist");
            println!();
        }
    }

    Ok(0)
}
