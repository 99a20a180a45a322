//! Standalone gate checks: `conductor scope` and `conductor constraint`.
//!
//! Both exit non-zero when the gate rejects, so they can run from git hooks
//! or an agent's tool-use hook.

use anyhow::{Context, Result};
use console::style;
use serde::Serialize;
use std::path::Path;

use super::{load_manifests, print_json};
use conductor::conductor_config::ConductorConfig;
use conductor::constraints::{Action, Outcome, RuleSource, Violation, evaluate};
use conductor::scope::{self, PathClass, ScopeVerdict};
use conductor::tracker::GitTracker;
use conductor::ui::icons::{CHECK, CROSS, WARN};

#[derive(Serialize)]
struct ScopeOutput<'a> {
    unit: &'a str,
    #[serde(flatten)]
    verdict: &'a ScopeVerdict,
}

pub fn cmd_scope(
    project_dir: &Path,
    feature: &str,
    unit_id: &str,
    staged: bool,
    base: Option<&str>,
    json: bool,
) -> Result<i32> {
    let config = ConductorConfig::new(project_dir.to_path_buf())?;
    let manifests = load_manifests(&config, feature)?;
    let unit = manifests
        .get(unit_id)
        .with_context(|| format!("Unit '{}' not found in feature '{}'", unit_id, feature))?;

    let tracker = GitTracker::new(&config.project_dir)?;
    let changed = if staged {
        tracker.staged_paths()?
    } else {
        tracker.changed_since(base.unwrap_or("HEAD"))?
    };

    let verdict = scope::verify(&changed, &unit.scope, config.allowlist())?;
    tracing::info!(
        unit = unit_id,
        files = verdict.entries.len(),
        passed = verdict.passed,
        "scope checked"
    );

    if json {
        print_json(&ScopeOutput {
            unit: unit_id,
            verdict: &verdict,
        })?;
    } else {
        if verdict.entries.is_empty() {
            println!("No changed files.");
        }
        for entry in &verdict.entries {
            match entry.class {
                PathClass::InScope => println!("  {}{}", CHECK, entry.path),
                PathClass::Allowlisted => {
                    println!("  {}{} {}", WARN, entry.path, style("(allowlisted)").dim())
                }
                PathClass::Violation => println!(
                    "  {}{} {}",
                    CROSS,
                    style(&entry.path).red(),
                    style("(outside declared scope)").dim()
                ),
            }
        }
        println!();
        if verdict.passed {
            println!("{} scope check passed", style(unit_id).green().bold());
        } else {
            println!(
                "{} scope check failed: {} file(s) outside declared scope",
                style(unit_id).red().bold(),
                verdict.violations().len()
            );
        }
    }

    Ok(if verdict.passed { 0 } else { 1 })
}

#[derive(Serialize)]
struct ConstraintOutput<'a> {
    phase: &'a str,
    action: &'a Action,
    outcome: Outcome,
    violations: &'a [Violation],
    rules_missing: bool,
}

pub fn cmd_constraint(
    project_dir: &Path,
    phase: &str,
    action: &Action,
    rules_path: Option<&Path>,
    json: bool,
) -> Result<i32> {
    let rules_path = match rules_path {
        Some(path) => path.to_path_buf(),
        None => ConductorConfig::new(project_dir.to_path_buf())?.rules_file(),
    };

    let source = RuleSource::load(&rules_path)?;
    if source.is_missing() {
        eprintln!("{} {}", style("notice:").yellow().bold(), source.describe());
    }

    let violations = evaluate(phase, action, &source.rules());
    let outcome = Outcome::from_violations(&violations);
    tracing::info!(
        phase,
        action = %action,
        outcome = %outcome,
        violations = violations.len(),
        "constraint evaluated"
    );

    if json {
        print_json(&ConstraintOutput {
            phase,
            action,
            outcome,
            violations: &violations,
            rules_missing: source.is_missing(),
        })?;
    } else {
        for v in &violations {
            println!(
                "  [{}] {}: {}",
                style(v.severity).yellow(),
                style(&v.rule_id).bold(),
                v.message
            );
        }
        println!("{}: {}", action, style(outcome).bold());
    }

    Ok(outcome.exit_code())
}
