use super::{ExecutorConfig, RunOutcome, RunReport, UnitEvent, UnitResult, Worker};
use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::constraints::{Action, Outcome, RuleSet, Severity, evaluate};
use crate::dag::DependencyGraph;
use crate::errors::ConductorError;
use crate::evidence::{EvidenceLog, event_types};
use crate::manifest::WorkUnit;
use crate::scope;
use serde_json::json;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

/// Successful attempt that passed every gate.
struct Accepted {
    touched_files: Vec<String>,
    warnings: Vec<String>,
}

/// How a unit's attempt loop ended.
enum UnitEnd {
    Completed,
    Blocked,
    Stopped { rule: String, severity: Severity },
    Cancelled,
}

/// Drives one run over a resolved order.
pub struct Executor {
    config: ExecutorConfig,
    checkpoints: Box<dyn CheckpointStore>,
    evidence: EvidenceLog,
    rules: RuleSet,
    event_tx: Option<mpsc::Sender<UnitEvent>>,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        checkpoints: Box<dyn CheckpointStore>,
        evidence: EvidenceLog,
        rules: RuleSet,
    ) -> Self {
        Self {
            config,
            checkpoints,
            evidence,
            rules,
            event_tx: None,
        }
    }

    /// Set the event channel for progress updates.
    pub fn with_event_channel(mut self, tx: mpsc::Sender<UnitEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &dyn CheckpointStore {
        self.checkpoints.as_ref()
    }

    pub fn evidence(&self) -> &EvidenceLog {
        &self.evidence
    }

    /// Execute `order` starting from `checkpoint`.
    ///
    /// Completed units are skipped, so calling this again with the saved
    /// checkpoint resumes the run. Unit-local failures are retried in place;
    /// run-fatal errors (store I/O, chain corruption, unknown units) are
    /// returned as `Err` without further retries.
    pub async fn run(
        &mut self,
        graph: &DependencyGraph,
        order: &[String],
        mut checkpoint: Checkpoint,
        worker: &dyn Worker,
        cancel: &CancellationToken,
    ) -> Result<RunReport, ConductorError> {
        let started = Instant::now();
        let run_id = checkpoint.run_id.clone();

        self.evidence.verify()?;
        self.evidence.ensure_intact()?;

        // Reject unknown ids before anything is recorded
        for id in order {
            if graph.get(id).is_none() {
                return Err(ConductorError::UnresolvedDependency {
                    unit: run_id.clone(),
                    dependency: id.clone(),
                });
            }
        }

        let resumed = !checkpoint.is_fresh();
        let marker = if resumed {
            event_types::RUN_RESUMED
        } else {
            event_types::RUN_STARTED
        };
        self.evidence.append(
            marker,
            json!({
                "run": run_id,
                "order": order,
                "completed": checkpoint.completed,
                "max_retries": self.config.max_retries,
                "phase": self.config.phase,
            }),
        )?;
        tracing::info!(run_id = %run_id, units = order.len(), resumed, "run started");
        self.emit(UnitEvent::RunStarted {
            run_id: run_id.clone(),
            total: order.len(),
            resumed,
        })
        .await;

        let mut report = RunReport {
            run_id: run_id.clone(),
            outcome: RunOutcome::Completed,
            executed: Vec::new(),
            skipped: Vec::new(),
            results: Vec::new(),
            statuses: Default::default(),
            duration: Default::default(),
        };

        for id in order {
            let Some(unit) = graph.get(id) else {
                continue;
            };

            if checkpoint.is_completed(id) {
                tracing::debug!(unit = %id, "already completed, skipping");
                report.skipped.push(id.clone());
                self.emit(UnitEvent::UnitSkipped { unit: id.clone() }).await;
                continue;
            }

            if checkpoint.is_blocked(id) || checkpoint.is_exhausted(id, self.config.max_retries) {
                // Exhausted but not yet blocked means a crash between the two saves
                if !checkpoint.is_blocked(id) {
                    self.block(graph, &mut checkpoint, id).await?;
                }
                tracing::error!(unit = %id, "unit is blocked; run halted");
                self.evidence.append(
                    event_types::RUN_HALTED,
                    json!({ "unit": id, "reason": "unit is blocked" }),
                )?;
                report.outcome = RunOutcome::Halted { unit: id.clone() };
                break;
            }

            if cancel.is_cancelled() {
                self.cancelled(&checkpoint)?;
                report.outcome = RunOutcome::Cancelled;
                break;
            }

            report.executed.push(id.clone());
            let mut result = UnitResult::new(id);
            let end = self
                .run_unit(graph, unit, &mut checkpoint, worker, cancel, &mut result)
                .await?;
            result.status = checkpoint.status_of(id);
            report.results.push(result);

            match end {
                UnitEnd::Completed => {}
                UnitEnd::Blocked => {
                    report.outcome = RunOutcome::Halted { unit: id.clone() };
                    break;
                }
                UnitEnd::Stopped { rule, severity } => {
                    report.outcome = RunOutcome::Stopped {
                        unit: id.clone(),
                        rule,
                        severity,
                    };
                    break;
                }
                UnitEnd::Cancelled => {
                    self.cancelled(&checkpoint)?;
                    report.outcome = RunOutcome::Cancelled;
                    break;
                }
            }
        }

        if report.outcome.is_success() && !report.executed.is_empty() {
            self.evidence.append(
                event_types::RUN_COMPLETED,
                json!({
                    "run": run_id,
                    "executed": report.executed,
                    "skipped": report.skipped,
                }),
            )?;
        }

        report.statuses = order
            .iter()
            .map(|id| (id.clone(), checkpoint.status_of(id)))
            .collect();
        report.duration = started.elapsed();

        tracing::info!(
            run_id = %run_id,
            outcome = ?report.outcome,
            executed = report.executed.len(),
            skipped = report.skipped.len(),
            "run finished"
        );
        self.emit(UnitEvent::RunFinished {
            outcome: report.outcome.clone(),
        })
        .await;
        Ok(report)
    }

    /// Attempt `unit` until it succeeds, exhausts its retries, hits a
    /// session-stopping constraint or observes cancellation.
    async fn run_unit(
        &mut self,
        graph: &DependencyGraph,
        unit: &WorkUnit,
        checkpoint: &mut Checkpoint,
        worker: &dyn Worker,
        cancel: &CancellationToken,
        result: &mut UnitResult,
    ) -> Result<UnitEnd, ConductorError> {
        let id = unit.id.as_str();

        // One baseline per unit, so every attempt is judged against the same tree
        worker
            .begin_unit(unit)
            .await
            .map_err(|e| ConductorError::WorkerFailure {
                unit: unit.id.clone(),
                message: format!("{:#}", e),
            })?;

        loop {
            let attempt = checkpoint.retries_for(id) + 1;
            result.attempts += 1;
            tracing::info!(unit = %id, attempt, "unit started");
            self.emit(UnitEvent::UnitStarted {
                unit: id.to_string(),
                attempt,
            })
            .await;

            let failure = match self.attempt(unit, attempt, worker).await {
                Ok(accepted) => {
                    checkpoint.mark_completed(id);
                    self.checkpoints.save(checkpoint)?;
                    self.evidence.append(
                        event_types::UNIT_COMPLETED,
                        json!({
                            "unit": id,
                            "attempt": attempt,
                            "touched_files": accepted.touched_files,
                            "warnings": accepted.warnings,
                        }),
                    )?;
                    tracing::info!(unit = %id, attempt, "unit completed");
                    self.emit(UnitEvent::UnitCompleted {
                        unit: id.to_string(),
                        attempt,
                        warnings: accepted.warnings.clone(),
                    })
                    .await;
                    result.touched_files = accepted.touched_files;
                    result.warnings.extend(accepted.warnings);
                    return Ok(UnitEnd::Completed);
                }
                Err(ConductorError::ConstraintViolation {
                    rule,
                    severity,
                    message,
                }) if severity.stops_session() => {
                    checkpoint.touch();
                    self.checkpoints.save(checkpoint)?;
                    tracing::error!(unit = %id, rule = %rule, %severity, "constraint stopped the run");
                    self.evidence.append(
                        event_types::RUN_HALTED,
                        json!({
                            "unit": id,
                            "attempt": attempt,
                            "rule": rule,
                            "severity": severity,
                            "message": message,
                        }),
                    )?;
                    result.errors.push(message);
                    return Ok(UnitEnd::Stopped { rule, severity });
                }
                Err(e) if e.is_run_fatal() => return Err(e),
                Err(e) => e,
            };

            let failures = checkpoint.record_failure(id);
            self.checkpoints.save(checkpoint)?;

            let (event_type, details) = match &failure {
                ConductorError::ScopeViolation { paths, .. } => {
                    (event_types::SCOPE_VIOLATION, json!({ "paths": paths }))
                }
                ConductorError::ConstraintViolation { rule, severity, .. } => (
                    event_types::CONSTRAINT_BLOCKED,
                    json!({ "rule": rule, "severity": severity }),
                ),
                _ => (event_types::UNIT_FAILED, json!({})),
            };
            self.evidence.append(
                event_type,
                json!({
                    "unit": id,
                    "attempt": attempt,
                    "failures": failures,
                    "error": failure.to_string(),
                    "details": details,
                }),
            )?;

            let exhausted = checkpoint.is_exhausted(id, self.config.max_retries);
            tracing::warn!(
                unit = %id,
                attempt,
                failures,
                max_retries = self.config.max_retries,
                error = %failure,
                "unit attempt failed"
            );
            self.emit(UnitEvent::UnitFailed {
                unit: id.to_string(),
                attempt,
                error: failure.to_string(),
                will_retry: !exhausted,
            })
            .await;
            result.errors.push(failure.to_string());

            if exhausted {
                self.block(graph, checkpoint, id).await?;
                return Ok(UnitEnd::Blocked);
            }
            if cancel.is_cancelled() {
                return Ok(UnitEnd::Cancelled);
            }
        }
    }

    /// One worker invocation followed by the scope and constraint gates.
    async fn attempt(
        &mut self,
        unit: &WorkUnit,
        attempt: u32,
        worker: &dyn Worker,
    ) -> Result<Accepted, ConductorError> {
        let output = match timeout(self.config.unit_timeout, worker.run(unit, attempt)).await {
            Err(_) => {
                return Err(ConductorError::WorkerFailure {
                    unit: unit.id.clone(),
                    message: format!(
                        "timed out after {}s",
                        self.config.unit_timeout.as_secs_f64()
                    ),
                });
            }
            Ok(Err(e)) => {
                return Err(ConductorError::WorkerFailure {
                    unit: unit.id.clone(),
                    message: format!("{:#}", e),
                });
            }
            Ok(Ok(output)) => output,
        };

        if !output.success {
            return Err(ConductorError::WorkerFailure {
                unit: unit.id.clone(),
                message: output
                    .error
                    .unwrap_or_else(|| "worker reported failure".to_string()),
            });
        }

        // Scope compliance is a hard gate even when the worker succeeded
        let verdict = scope::verify(&output.touched_files, &unit.scope, &self.config.allowlist)?;
        let mut warnings = verdict.warnings.clone();
        let verdict = verdict.into_result(&unit.id)?;

        let mut violations = Vec::new();
        for entry in &verdict.entries {
            violations.extend(evaluate(
                &self.config.phase,
                &Action::Path(entry.path.clone()),
                &self.rules,
            ));
        }

        match Outcome::from_violations(&violations) {
            Outcome::Proceed => {}
            Outcome::Warn => {
                for v in &violations {
                    tracing::warn!(unit = %unit.id, rule = %v.rule_id, "{}", v.message);
                    self.evidence.append(
                        event_types::CONSTRAINT_WARNING,
                        json!({
                            "unit": unit.id,
                            "attempt": attempt,
                            "rule": v.rule_id,
                            "message": v.message,
                        }),
                    )?;
                    warnings.push(format!("{}: {}", v.rule_id, v.message));
                }
            }
            Outcome::Block | Outcome::Stop => {
                let worst = violations
                    .into_iter()
                    .max_by_key(|v| v.severity)
                    .ok_or_else(|| ConductorError::WorkerFailure {
                        unit: unit.id.clone(),
                        message: "constraint outcome without a violation".to_string(),
                    })?;
                return Err(worst.into_error());
            }
        }

        Ok(Accepted {
            touched_files: verdict.entries.into_iter().map(|e| e.path).collect(),
            warnings,
        })
    }

    /// Mark `id` and everything that transitively depends on it as blocked.
    async fn block(
        &mut self,
        graph: &DependencyGraph,
        checkpoint: &mut Checkpoint,
        id: &str,
    ) -> Result<(), ConductorError> {
        let dependents = graph.dependents_transitive(id);
        checkpoint.mark_blocked(std::iter::once(id).chain(dependents.iter().map(String::as_str)));
        self.checkpoints.save(checkpoint)?;
        self.evidence.append(
            event_types::UNIT_BLOCKED,
            json!({
                "unit": id,
                "failures": checkpoint.retries_for(id),
                "dependents": dependents,
            }),
        )?;
        tracing::error!(unit = %id, dependents = ?dependents, "unit blocked after exhausting retries");
        self.emit(UnitEvent::UnitBlocked {
            unit: id.to_string(),
            dependents,
        })
        .await;
        Ok(())
    }

    fn cancelled(&mut self, checkpoint: &Checkpoint) -> Result<(), ConductorError> {
        self.checkpoints.save(checkpoint)?;
        self.evidence.append(
            event_types::RUN_CANCELLED,
            json!({ "run": checkpoint.run_id, "completed": checkpoint.completed }),
        )?;
        tracing::warn!(run_id = %checkpoint.run_id, "run cancelled");
        Ok(())
    }

    async fn emit(&self, event: UnitEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }
}
