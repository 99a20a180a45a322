//! Evidence log inspection: `conductor evidence verify|show`.

use anyhow::Result;
use console::style;
use std::path::Path;

use super::super::EvidenceCommands;
use super::print_json;
use conductor::conductor_config::ConductorConfig;
use conductor::evidence::{EvidenceLog, JsonlEvidenceStore};
use conductor::ui::icons::{CHECK, CROSS};

fn open_log(project_dir: &Path, feature: &str) -> Result<(EvidenceLog, String)> {
    let config = ConductorConfig::new(project_dir.to_path_buf())?;
    let store = JsonlEvidenceStore::for_run(&config.evidence_dir(), feature);
    let location = store.path().display().to_string();
    Ok((EvidenceLog::open(Box::new(store))?, location))
}

pub fn cmd_evidence(project_dir: &Path, command: &EvidenceCommands, json: bool) -> Result<i32> {
    match command {
        EvidenceCommands::Verify { feature } => {
            let (mut log, location) = open_log(project_dir, feature)?;
            let report = log.verify()?;

            if json {
                print_json(&report)?;
            } else if report.valid {
                println!(
                    "{}Evidence chain intact: {} event(s) in {}",
                    CHECK, report.events, location
                );
            } else {
                println!(
                    "{}Evidence chain broken at index {}: {}",
                    CROSS,
                    style(report.first_bad_index.unwrap_or_default()).red().bold(),
                    report.reason.as_deref().unwrap_or("unknown reason")
                );
                println!("  log: {}", location);
            }
            Ok(if report.valid { 0 } else { 1 })
        }
        EvidenceCommands::Show { feature, tail } => {
            let (log, _) = open_log(project_dir, feature)?;
            let events = log.events()?;
            let skip = tail.map_or(0, |n| events.len().saturating_sub(n));

            for (index, event) in events.iter().enumerate().skip(skip) {
                if json {
                    println!("{}", serde_json::to_string(event)?);
                } else {
                    println!(
                        "{:>4} {} {:<20} {} {}",
                        index,
                        style(event.timestamp.format("%Y-%m-%d %H:%M:%S")).dim(),
                        style(&event.event_type).cyan(),
                        event.payload,
                        style(event.hash.get(..12).unwrap_or(&event.hash)).dim()
                    );
                }
            }
            if !json && events.is_empty() {
                println!("No evidence recorded for '{}'", feature);
            }
            if let Some((index, reason)) = log.corruption() {
                eprintln!(
                    "{} chain is corrupt at index {}: {}",
                    style("warning:").yellow().bold(),
                    index,
                    reason
                );
            }
            Ok(0)
        }
    }
}
