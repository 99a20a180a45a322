//! The external build step the executor invokes once per unit attempt.

use crate::manifest::WorkUnit;
use crate::tracker::{GitTracker, WorktreeSnapshot};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// What a worker reports back for one attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerOutput {
    pub success: bool,
    /// Repo-relative paths the worker actually changed
    pub touched_files: Vec<String>,
    pub error: Option<String>,
}

impl WorkerOutput {
    pub fn success<S: Into<String>>(touched_files: impl IntoIterator<Item = S>) -> Self {
        Self {
            success: true,
            touched_files: touched_files.into_iter().map(Into::into).collect(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            touched_files: Vec::new(),
            error: Some(error.into()),
        }
    }
}

/// Performs the work for one unit. Opaque to the executor.
///
/// An `Err` from `run` is treated like a reported failure: retryable up to
/// the configured ceiling.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Called once per unit, before its first attempt in this invocation.
    ///
    /// `touched_files` reported by every later attempt of the unit must be
    /// relative to the state captured here, so leftovers from a failed
    /// attempt stay visible to the scope gate.
    async fn begin_unit(&self, _unit: &WorkUnit) -> Result<()> {
        Ok(())
    }

    async fn run(&self, unit: &WorkUnit, attempt: u32) -> Result<WorkerOutput>;
}

/// Runs a shell command per unit and derives touched files from git.
///
/// The command sees `CONDUCTOR_UNIT_ID`, `CONDUCTOR_FEATURE`,
/// `CONDUCTOR_ATTEMPT` and `CONDUCTOR_SCOPE` (newline-separated globs) in its
/// environment. Exit code 0 is success. The command runs in its own process
/// group, which is killed when the attempt ends or is abandoned.
pub struct CommandWorker {
    command: String,
    project_dir: PathBuf,
    /// Working tree state at the start of the current unit
    baseline: Mutex<Option<(String, WorktreeSnapshot)>>,
}

/// Lines of stderr kept in a failure message.
const STDERR_TAIL_LINES: usize = 20;

impl CommandWorker {
    pub fn new(command: &str, project_dir: &Path) -> Self {
        Self {
            command: command.to_string(),
            project_dir: project_dir.to_path_buf(),
            baseline: Mutex::new(None),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    fn capture_baseline(&self, unit: &WorkUnit) -> Result<WorktreeSnapshot> {
        let snapshot = GitTracker::new(&self.project_dir)?
            .snapshot()
            .context("Failed to snapshot working tree before unit")?;
        let mut slot = self
            .baseline
            .lock()
            .map_err(|_| anyhow::anyhow!("worker baseline lock poisoned"))?;
        *slot = Some((unit.id.clone(), snapshot.clone()));
        Ok(snapshot)
    }

    /// Baseline for `unit`, captured now if `begin_unit` was not called for it.
    fn baseline_for(&self, unit: &WorkUnit) -> Result<WorktreeSnapshot> {
        let existing = self
            .baseline
            .lock()
            .map_err(|_| anyhow::anyhow!("worker baseline lock poisoned"))?
            .as_ref()
            .filter(|(id, _)| *id == unit.id)
            .map(|(_, snapshot)| snapshot.clone());
        match existing {
            Some(snapshot) => Ok(snapshot),
            None => self.capture_baseline(unit),
        }
    }
}

/// Kills a worker's process group when dropped, including on timeout.
#[cfg_attr(not(unix), allow(dead_code))]
struct ProcessGroup(Option<u32>);

#[cfg(unix)]
impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if let Some(pgid) = self.0 {
            // ESRCH just means the group already exited
            unsafe {
                libc::killpg(pgid as libc::pid_t, libc::SIGKILL);
            }
        }
    }
}

async fn read_pipe<R: AsyncRead + Unpin>(pipe: Option<R>) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    buf
}

#[async_trait]
impl Worker for CommandWorker {
    async fn begin_unit(&self, unit: &WorkUnit) -> Result<()> {
        self.capture_baseline(unit).map(|_| ())
    }

    async fn run(&self, unit: &WorkUnit, attempt: u32) -> Result<WorkerOutput> {
        let before = self.baseline_for(unit)?;

        let scope: Vec<&str> = unit.scope.patterns().collect();
        tracing::debug!(unit = %unit.id, attempt, command = %self.command, "spawning worker");
        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("CONDUCTOR_UNIT_ID", &unit.id)
            .env("CONDUCTOR_FEATURE", &unit.feature)
            .env("CONDUCTOR_ATTEMPT", attempt.to_string())
            .env("CONDUCTOR_SCOPE", scope.join("\n"))
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn worker command: {}", self.command))?;
        let group = ProcessGroup(child.id());
        // Pipes are drained off-task: a background child holding them open
        // must not keep the attempt alive after `sh` exits
        let stdout_reader = tokio::spawn(read_pipe(child.stdout.take()));
        let stderr_reader = tokio::spawn(read_pipe(child.stderr.take()));
        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for worker command: {}", self.command))?;
        drop(group);
        let stdout = stdout_reader.await.context("Worker stdout reader failed")?;
        let stderr = stderr_reader.await.context("Worker stderr reader failed")?;

        let stdout = String::from_utf8_lossy(&stdout);
        if !stdout.trim().is_empty() {
            tracing::debug!(unit = %unit.id, stdout = %stdout.trim(), "worker output");
        }

        let touched = GitTracker::new(&self.project_dir)?
            .touched_since(&before)
            .context("Failed to compute files touched by unit")?;

        if status.success() {
            return Ok(WorkerOutput::success(touched));
        }

        let stderr = String::from_utf8_lossy(&stderr);
        let lines: Vec<&str> = stderr.lines().collect();
        let tail = lines[lines.len().saturating_sub(STDERR_TAIL_LINES)..].join("\n");
        let code = status
            .code()
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        let mut error = format!("worker exited with {}", code);
        if !tail.is_empty() {
            error.push_str(": ");
            error.push_str(&tail);
        }
        Ok(WorkerOutput {
            success: false,
            touched_files: touched,
            error: Some(error),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{Checkpoint, MemoryCheckpointStore};
    use crate::constraints::RuleSet;
    use crate::dag::DependencyGraph;
    use crate::evidence::{EvidenceLog, MemoryEvidenceStore, event_types};
    use crate::executor::{Executor, ExecutorConfig, RunOutcome};
    use crate::manifest::{DeclaredScope, UnitStatus};
    use git2::Repository;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn setup_repo() -> TempDir {
        let dir = TempDir::new().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::write(dir.path().join("README.md"), "readme\n").unwrap();
        let mut index = repo.index().unwrap();
        index
            .add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)
            .unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = git2::Signature::now("test", "test@test.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
            .unwrap();
        dir
    }

    fn unit() -> WorkUnit {
        WorkUnit::new("WS-01", "checkout", vec![])
            .with_scope(DeclaredScope::new(vec!["src/**".into()], vec![]))
    }

    #[tokio::test]
    async fn test_command_worker_reports_touched_files() {
        let dir = setup_repo();
        let worker = CommandWorker::new(
            "mkdir -p src && echo \"$CONDUCTOR_UNIT_ID $CONDUCTOR_ATTEMPT\" > src/out.txt",
            dir.path(),
        );
        let output = worker.run(&unit(), 2).await.unwrap();
        assert!(output.success);
        assert_eq!(output.touched_files, vec!["src/out.txt"]);
        let written = fs::read_to_string(dir.path().join("src/out.txt")).unwrap();
        assert_eq!(written.trim(), "WS-01 2");
    }

    #[tokio::test]
    async fn test_command_worker_failure_carries_exit_code_and_stderr() {
        let dir = setup_repo();
        let worker = CommandWorker::new("echo boom >&2; exit 3", dir.path());
        let output = worker.run(&unit(), 1).await.unwrap();
        assert!(!output.success);
        let error = output.error.unwrap();
        assert!(error.contains("exited with 3"));
        assert!(error.contains("boom"));
    }

    #[tokio::test]
    async fn test_command_worker_requires_git_repository() {
        let dir = TempDir::new().unwrap();
        let worker = CommandWorker::new("true", dir.path());
        assert!(worker.run(&unit(), 1).await.is_err());
    }

    #[tokio::test]
    async fn test_baseline_spans_attempts_of_a_unit() {
        let dir = setup_repo();
        let worker = CommandWorker::new(
            "if [ \"$CONDUCTOR_ATTEMPT\" = 1 ]; then echo leak > secret.txt; \
             else mkdir -p src && echo ok > src/a.rs; fi",
            dir.path(),
        );
        worker.begin_unit(&unit()).await.unwrap();
        let first = worker.run(&unit(), 1).await.unwrap();
        assert_eq!(first.touched_files, vec!["secret.txt"]);

        let second = worker.run(&unit(), 2).await.unwrap();
        assert_eq!(second.touched_files, vec!["secret.txt", "src/a.rs"]);
    }

    #[tokio::test]
    async fn test_begin_unit_resets_baseline_for_next_unit() {
        let dir = setup_repo();
        let worker = CommandWorker::new(
            "echo \"$CONDUCTOR_UNIT_ID\" > \"$CONDUCTOR_UNIT_ID.txt\"",
            dir.path(),
        );
        worker.begin_unit(&unit()).await.unwrap();
        worker.run(&unit(), 1).await.unwrap();

        let next = WorkUnit::new("WS-02", "checkout", vec![]);
        worker.begin_unit(&next).await.unwrap();
        let output = worker.run(&next, 1).await.unwrap();
        assert_eq!(output.touched_files, vec!["WS-02.txt"]);
    }

    async fn drive(command: &str) -> (crate::executor::RunReport, Executor, TempDir) {
        let dir = setup_repo();
        let worker = CommandWorker::new(command, dir.path());
        let graph = DependencyGraph::build(vec![unit()]).unwrap();
        let order = graph.topological_order().unwrap();
        let mut exec = Executor::new(
            ExecutorConfig {
                max_retries: 2,
                ..Default::default()
            },
            Box::new(MemoryCheckpointStore::new()),
            EvidenceLog::open(Box::new(MemoryEvidenceStore::new())).unwrap(),
            RuleSet::empty(),
        );
        let report = exec
            .run(
                &graph,
                &order,
                Checkpoint::new("checkout"),
                &worker,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        (report, exec, dir)
    }

    fn scope_violation_paths(exec: &Executor) -> Vec<serde_json::Value> {
        exec.evidence()
            .events()
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type == event_types::SCOPE_VIOLATION)
            .map(|e| e.payload["details"]["paths"].clone())
            .collect()
    }

    #[tokio::test]
    async fn test_out_of_scope_leftover_is_not_cleared_by_retry() {
        let (report, exec, dir) = drive(
            "if [ \"$CONDUCTOR_ATTEMPT\" = 1 ]; then echo leak > secret.txt; \
             else mkdir -p src && echo ok > src/a.rs; fi",
        )
        .await;

        assert_eq!(report.outcome, RunOutcome::Halted { unit: "WS-01".into() });
        assert_eq!(report.statuses["WS-01"], UnitStatus::Blocked);
        assert_eq!(report.result("WS-01").unwrap().attempts, 2);
        let violations = scope_violation_paths(&exec);
        assert_eq!(violations.len(), 2);
        assert!(violations.iter().all(|p| p.to_string().contains("secret.txt")));
        assert!(dir.path().join("secret.txt").exists());
    }

    #[tokio::test]
    async fn test_failed_attempt_leftover_is_caught_on_successful_retry() {
        let (report, exec, _dir) = drive(
            "if [ \"$CONDUCTOR_ATTEMPT\" = 1 ]; then echo leak > secret.txt; exit 1; fi; \
             mkdir -p src && echo ok > src/a.rs",
        )
        .await;

        assert_eq!(report.outcome, RunOutcome::Halted { unit: "WS-01".into() });
        assert_eq!(report.statuses["WS-01"], UnitStatus::Blocked);
        let types: Vec<String> = exec
            .evidence()
            .events()
            .unwrap()
            .into_iter()
            .map(|e| e.event_type)
            .collect();
        assert!(types.contains(&event_types::UNIT_FAILED.to_string()));
        assert!(!types.contains(&event_types::UNIT_COMPLETED.to_string()));
        let violations = scope_violation_paths(&exec);
        assert_eq!(violations.len(), 1);
        assert!(violations[0].to_string().contains("secret.txt"));
    }

    #[tokio::test]
    async fn test_in_scope_retry_still_completes() {
        let (report, _exec, _dir) = drive(
            "mkdir -p src && echo \"$CONDUCTOR_ATTEMPT\" > src/a.rs; \
             [ \"$CONDUCTOR_ATTEMPT\" = 2 ]",
        )
        .await;

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.result("WS-01").unwrap().touched_files, vec!["src/a.rs"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timed_out_attempt_kills_background_children() {
        let dir = setup_repo();
        let worker = CommandWorker::new("(sleep 1; echo late > late.txt) & sleep 30", dir.path());
        let result = tokio::time::timeout(Duration::from_millis(300), worker.run(&unit(), 1)).await;
        assert!(result.is_err());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("late.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_background_children_do_not_outlive_attempt() {
        let dir = setup_repo();
        let worker = CommandWorker::new("(sleep 1; echo late > late.txt) & exit 0", dir.path());
        let output = tokio::time::timeout(Duration::from_secs(5), worker.run(&unit(), 1))
            .await
            .unwrap()
            .unwrap();
        assert!(output.success);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!dir.path().join("late.txt").exists());
    }

    #[test]
    fn test_worker_output_constructors() {
        let ok = WorkerOutput::success(["a.rs"]);
        assert!(ok.success);
        assert_eq!(ok.touched_files, vec!["a.rs"]);
        let bad = WorkerOutput::failure("nope");
        assert!(!bad.success);
        assert_eq!(bad.error.as_deref(), Some("nope"));
    }
}
