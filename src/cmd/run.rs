//! Feature execution: `conductor run`.

use anyhow::{Context, Result};
use console::style;
use std::path::Path;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{load_plan, require_initialized};
use conductor::checkpoint::{CheckpointStore, FileCheckpointStore, RunLock};
use conductor::conductor_config::{CliOverrides, ConductorConfig};
use conductor::constraints::RuleSource;
use conductor::evidence::{EvidenceLog, JsonlEvidenceStore};
use conductor::executor::{CommandWorker, Executor, ExecutorConfig, UnitEvent};
use conductor::ui::{RunUI, UiMode};

pub async fn cmd_run(
    project_dir: &Path,
    feature: &str,
    overrides: CliOverrides,
    mode: UiMode,
    verbose: bool,
) -> Result<i32> {
    require_initialized(project_dir)?;

    let config = ConductorConfig::new(project_dir.to_path_buf())?.with_cli_overrides(overrides);

    let Some(worker_cmd) = config.worker_cmd() else {
        anyhow::bail!(
            "No worker command configured. Pass --worker-cmd, set CONDUCTOR_WORKER_CMD, \
             or set executor.worker_cmd in .conductor/conductor.toml"
        );
    };

    // Held until the run returns
    let _lock = RunLock::acquire(&config.locks_dir(), feature)?;

    let (graph, order) = load_plan(&config, feature)?;

    let store = FileCheckpointStore::new(&config.checkpoints_dir());
    let checkpoint = store.load(feature)?;

    let evidence = EvidenceLog::open(Box::new(JsonlEvidenceStore::for_run(
        &config.evidence_dir(),
        feature,
    )))?;

    let rule_source = RuleSource::load(&config.rules_file())?;
    if rule_source.is_missing() {
        eprintln!(
            "{} {}",
            style("notice:").yellow().bold(),
            rule_source.describe()
        );
    } else if verbose {
        eprintln!("constraints: {}", rule_source.describe());
    }

    let exec_config = ExecutorConfig {
        max_retries: config.max_retries(),
        unit_timeout: config.unit_timeout(),
        allowlist: config.allowlist().to_vec(),
        phase: config.phase(),
    };
    tracing::info!(
        feature,
        units = order.len(),
        max_retries = exec_config.max_retries,
        timeout_secs = exec_config.unit_timeout.as_secs(),
        "starting run"
    );

    let (tx, mut rx) = mpsc::channel::<UnitEvent>(100);
    let ui_task = tokio::spawn(async move {
        let mut ui = RunUI::new(mode, verbose);
        while let Some(event) = rx.recv().await {
            ui.handle_event(&event);
        }
    });

    let cancel = CancellationToken::new();
    let ctrl_c = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nCancelling after the current unit...");
                cancel.cancel();
            }
        })
    };

    let worker = CommandWorker::new(&worker_cmd, &config.project_dir);
    let mut executor = Executor::new(
        exec_config,
        Box::new(store),
        evidence,
        rule_source.rules(),
    )
    .with_event_channel(tx);

    let result = executor.run(&graph, &order, checkpoint, &worker, &cancel).await;

    // Dropping the executor closes the channel so the UI task drains and exits
    drop(executor);
    ctrl_c.abort();
    ui_task.await.context("Progress UI task failed")?;

    let report = result?;
    if mode == UiMode::Json {
        println!(
            "{}",
            serde_json::to_string(&report).context("Failed to serialize run report")?
        );
    } else {
        println!(
            "{} executed, {} skipped in {:.1}s",
            report.executed.len(),
            report.skipped.len(),
            report.duration.as_secs_f64()
        );
    }

    Ok(report.outcome.exit_code())
}
