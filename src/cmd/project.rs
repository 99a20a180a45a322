//! Project initialization and planning commands.

use anyhow::Result;
use console::style;
use serde::Serialize;
use std::path::Path;

use super::{load_plan, print_json};

pub fn cmd_init(project_dir: &Path) -> Result<i32> {
    use conductor::init::{init_project, is_initialized};

    let was_initialized = is_initialized(project_dir);
    let result = init_project(project_dir)?;

    if result.created {
        println!(
            "Initialized conductor project at {}",
            result.state_dir.display()
        );
        println!();
        println!("Created directory structure:");
        println!("  .conductor/");
        println!("  ├── conductor.toml  # Configuration (use `conductor config show`)");
        println!("  ├── rules.toml      # Constraint rules");
        println!("  ├── checkpoints/    # Run progress");
        println!("  ├── evidence/       # Hash-chained evidence logs");
        println!("  ├── locks/          # Run locks");
        println!("  ├── logs/           # Log files");
        println!("  └── attestations/   # Attestation statements");
        println!();
        println!("Next steps:");
        println!("  1. Set executor.worker_cmd in .conductor/conductor.toml");
        println!("  2. Run `conductor plan --feature <id>` to check the order");
        println!("  3. Run `conductor run --feature <id>` to start execution");
    } else if was_initialized {
        println!(
            "Conductor project already initialized at {}",
            result.state_dir.display()
        );
        println!("Directory structure verified.");
    } else {
        println!(
            "Completed conductor initialization at {}",
            result.state_dir.display()
        );
    }

    Ok(0)
}

#[derive(Serialize)]
struct PlanOutput<'a> {
    feature: &'a str,
    order: &'a [String],
    waves: Vec<Vec<String>>,
}

pub fn cmd_plan(project_dir: &Path, feature: &str, json: bool) -> Result<i32> {
    let config = conductor::conductor_config::ConductorConfig::new(project_dir.to_path_buf())?;
    let (graph, order) = load_plan(&config, feature)?;
    let waves = graph.waves();

    if json {
        print_json(&PlanOutput {
            feature,
            order: &order,
            waves,
        })?;
        return Ok(0);
    }

    println!();
    println!(
        "Execution plan for {} ({} units)",
        style(feature).yellow().bold(),
        order.len()
    );
    println!();
    for (position, id) in order.iter().enumerate() {
        let Some(unit) = graph.get(id) else { continue };
        let deps = if unit.depends_on.is_empty() {
            String::new()
        } else {
            format!(" {}", style(format!("← {}", unit.depends_on.join(", "))).dim())
        };
        println!(
            "  {:>3}. {:<12} {}{}",
            position + 1,
            style(id).cyan(),
            unit.label(),
            deps
        );
    }
    println!();
    println!("Waves of independent units:");
    for (i, wave) in waves.iter().enumerate() {
        println!("  {} {}", style(format!("wave {}:", i + 1)).dim(), wave.join(", "));
    }
    println!();
    Ok(0)
}
