//! Run state commands: `conductor status` and `conductor reset`.

use anyhow::Result;
use console::style;
use serde::Serialize;
use std::path::Path;

use super::{load_plan, print_json, require_initialized};
use conductor::checkpoint::{CheckpointStore, FileCheckpointStore, RunLock};
use conductor::conductor_config::ConductorConfig;
use conductor::manifest::UnitStatus;

#[derive(Serialize)]
struct UnitRow {
    id: String,
    title: String,
    status: UnitStatus,
    retries: u32,
}

#[derive(Serialize)]
struct StatusOutput {
    feature: String,
    units: Vec<UnitRow>,
    updated_at: Option<String>,
}

pub fn cmd_status(project_dir: &Path, feature: &str, json: bool) -> Result<i32> {
    require_initialized(project_dir)?;
    let config = ConductorConfig::new(project_dir.to_path_buf())?;
    let (graph, order) = load_plan(&config, feature)?;

    let store = FileCheckpointStore::new(&config.checkpoints_dir());
    let checkpoint = store.load(feature)?;

    let units: Vec<UnitRow> = order
        .iter()
        .map(|id| UnitRow {
            id: id.clone(),
            title: graph
                .get(id)
                .map(|u| u.title.clone())
                .unwrap_or_default(),
            status: checkpoint.status_of(id),
            retries: checkpoint.retries_for(id),
        })
        .collect();

    if json {
        print_json(&StatusOutput {
            feature: feature.to_string(),
            units,
            updated_at: (!checkpoint.is_fresh()).then(|| checkpoint.updated_at.to_rfc3339()),
        })?;
        return Ok(0);
    }

    println!();
    println!("Feature {}", style(feature).yellow().bold());
    if checkpoint.is_fresh() {
        println!("No progress recorded yet.");
    } else {
        println!(
            "Last update: {}",
            checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
    }
    println!();
    println!("{:<14} {:<9} {:<8} Title", "Unit", "Status", "Retries");
    println!("{:<14} {:<9} {:<8} -----", "----", "------", "-------");
    for row in &units {
        let status = match row.status {
            UnitStatus::Done => style(row.status.to_string()).green(),
            UnitStatus::Blocked | UnitStatus::Failed => style(row.status.to_string()).red(),
            _ => style(row.status.to_string()).dim(),
        };
        println!(
            "{:<14} {:<9} {:<8} {}",
            row.id, status, row.retries, row.title
        );
    }

    let done = units
        .iter()
        .filter(|r| r.status == UnitStatus::Done)
        .count();
    println!();
    println!("{}/{} units done", done, units.len());
    println!();
    Ok(0)
}

pub fn cmd_reset(project_dir: &Path, feature: &str, force: bool) -> Result<i32> {
    use dialoguer::Confirm;

    require_initialized(project_dir)?;
    let config = ConductorConfig::new(project_dir.to_path_buf())?;

    if !force {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "This will reset all progress for '{}'. Are you sure?",
                feature
            ))
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(0);
        }
    }

    let _lock = RunLock::acquire(&config.locks_dir(), feature)?;
    let store = FileCheckpointStore::new(&config.checkpoints_dir());
    if store.clear(feature)? {
        tracing::info!(feature, "checkpoint cleared");
        println!("Reset complete (evidence log kept)");
    } else {
        println!("Nothing to reset for '{}'", feature);
    }
    Ok(0)
}
