//! Attestation generation: `conductor attest`.

use anyhow::Result;
use console::style;
use std::path::Path;

use super::print_json;
use conductor::attest::{self, AttestationBuilder, PrMeta, WriteMode};
use conductor::conductor_config::ConductorConfig;
use conductor::tracker::GitTracker;
use conductor::ui::icons::SPARKLE;

/// Arguments of `conductor attest`.
pub struct AttestArgs<'a> {
    pub base: &'a str,
    pub head: &'a str,
    pub pr: Option<u64>,
    pub pr_url: Option<&'a str>,
    pub output: Option<&'a Path>,
    pub report: Option<&'a Path>,
}

pub fn cmd_attest(project_dir: &Path, args: AttestArgs<'_>, json: bool) -> Result<i32> {
    let config = ConductorConfig::new(project_dir.to_path_buf())?;
    let tracker = GitTracker::new(&config.project_dir)?;

    let pr = args.pr.map(|number| PrMeta {
        number,
        url: args.pr_url.map(String::from),
    });
    let statement = AttestationBuilder::new(&tracker).build(args.base, args.head, pr)?;

    // Only a path named on the command line may replace an existing file
    let (output, mode) = match args.output {
        Some(path) => (path.to_path_buf(), WriteMode::Replace),
        None => (
            config.attestation_dir().join(attest::file_name(&statement)),
            WriteMode::CreateNew,
        ),
    };
    attest::write(&output, &statement, mode)?;

    let report = match args.report {
        Some(path) => Some((path.to_path_buf(), WriteMode::Replace)),
        None if config.attestation_report() => {
            Some((output.with_extension("md"), WriteMode::CreateNew))
        }
        None => None,
    };
    if let Some((path, mode)) = &report {
        attest::write_report(path, &statement, *mode)?;
    }

    if json {
        print_json(&statement)?;
        return Ok(0);
    }

    println!(
        "{}Attestation for {}..{} ({})",
        SPARKLE,
        style(&statement.base_branch).cyan(),
        style(&statement.head_ref).cyan(),
        statement
            .head_commit
            .get(..12)
            .unwrap_or(&statement.head_commit)
    );
    println!(
        "  {} file(s), {} {}",
        statement.files.len(),
        style(format!("+{}", statement.total_additions())).green(),
        style(format!("-{}", statement.total_deletions())).red()
    );
    println!("  statement: {}", output.display());
    if let Some((report, _)) = report {
        println!("  report:    {}", report.display());
    }
    Ok(0)
}
