//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module      | Commands handled                   |
//! |-------------|-------------------------------------|
//! | `project`   | `Init`, `Plan`                     |
//! | `run`       | `Run`                              |
//! | `state`     | `Status`, `Reset`                  |
//! | `gates`     | `Scope`, `Constraint`              |
//! | `evidence`  | `Evidence`                         |
//! | `attest`    | `Attest`                           |
//! | `config`    | `Config`                           |

pub mod attest;
pub mod config;
pub mod evidence;
pub mod gates;
pub mod project;
pub mod run;
pub mod state;

pub use attest::{AttestArgs, cmd_attest};
pub use config::cmd_config;
pub use evidence::cmd_evidence;
pub use gates::{cmd_constraint, cmd_scope};
pub use project::{cmd_init, cmd_plan};
pub use run::cmd_run;
pub use state::{cmd_reset, cmd_status};

use anyhow::{Context, Result};
use conductor::conductor_config::ConductorConfig;
use conductor::dag::DependencyGraph;
use conductor::manifest::{FeatureManifests, load_feature};
use std::path::Path;

pub(crate) fn require_initialized(project_dir: &Path) -> Result<()> {
    if !conductor::init::is_initialized(project_dir) {
        anyhow::bail!("Project not initialized. Run 'conductor init' first.");
    }
    Ok(())
}

/// Load a feature's manifests, reporting rejected files on stderr.
pub(crate) fn load_manifests(config: &ConductorConfig, feature: &str) -> Result<FeatureManifests> {
    let dir = config.workstreams_dir();
    let manifests = load_feature(&dir, feature)
        .with_context(|| format!("Failed to load manifests from {}", dir.display()))?;

    for error in &manifests.errors {
        eprintln!("{} {}", console::style("warning:").yellow().bold(), error);
    }
    if manifests.units.is_empty() {
        anyhow::bail!(
            "No work units found for feature '{}' under {}",
            feature,
            dir.display()
        );
    }
    Ok(manifests)
}

/// Load manifests and resolve them into a graph plus execution order.
pub(crate) fn load_plan(
    config: &ConductorConfig,
    feature: &str,
) -> Result<(DependencyGraph, Vec<String>)> {
    let manifests = load_manifests(config, feature)?;
    let graph = DependencyGraph::build(manifests.units)?;
    let order = graph.topological_order()?;
    Ok((graph, order))
}

pub(crate) fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}
