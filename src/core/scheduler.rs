//! Stage Scheduler.
//!
//! Executes a pipeline's stage DAG for one Change:
//! - a stage is ready once every dependency passed (or passed with an exception)
//! - ready stages launch in declaration order as tasks in a `JoinSet`
//! - a `parallel: false` stage waits for an idle pipeline and holds it while it runs
//! - adapter errors and timeouts retry with backoff while the stage allows it
//! - policy failures never retry
//! - the first final failure stops new launches, in-flight stages still finish
//!
//! Cancellation is cooperative. Tasks observe the watch signal before the
//! adapter call, after the result arrives and during backoff sleeps. An
//! aborted stage appends an `aborted` stage attestation.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{StageRequest, Tool, ToolRegistry};
use crate::domain::{Attestation, AttestationPayload, Change, FailureKind, StageRun, StageStatus};

use super::chain::AttestationChain;
use super::clock::Clock;
use super::error::{OrchestratorError, OrchestratorResult};
use super::pipeline::{PipelineDefinition, StageDefinition};
use super::policy::{evaluate_stage, PolicyDecision};

/// Called with every stage attestation right after it is appended
pub type AppendHook = Arc<dyn Fn(&Attestation) + Send + Sync>;

/// How a scheduling pass ended
#[derive(Debug)]
pub enum ScheduleOutcome {
    /// Every stage passed
    Completed,

    /// A stage failed finally; nothing new was launched afterwards
    Failed {
        stage: String,
        error: OrchestratorError,
    },

    /// Cancelled by an abort request. A stage failure seen before the
    /// abort took effect is kept in `halted_by`.
    Aborted { halted_by: Option<String> },
}

/// Runs stage DAGs against registered tools
#[derive(Clone)]
pub struct StageScheduler {
    pipeline: Arc<PipelineDefinition>,
    tools: Arc<ToolRegistry>,
    chain: Arc<AttestationChain>,
    clock: Arc<dyn Clock>,
    on_append: Option<AppendHook>,
}

impl StageScheduler {
    pub fn new(
        pipeline: Arc<PipelineDefinition>,
        tools: Arc<ToolRegistry>,
        chain: Arc<AttestationChain>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            pipeline,
            tools,
            chain,
            clock,
            on_append: None,
        }
    }

    pub fn on_append(mut self, hook: AppendHook) -> Self {
        self.on_append = Some(hook);
        self
    }

    /// Execute every stage not already in `finished` with a success status
    #[instrument(skip(self, change, finished, cancel), fields(change_id = %change.id, pipeline = %self.pipeline.name))]
    pub async fn run(
        &self,
        change: &Change,
        finished: &BTreeMap<String, StageRun>,
        cancel: watch::Receiver<bool>,
    ) -> OrchestratorResult<ScheduleOutcome> {
        self.pipeline.validate()?;
        self.tools.check_pipeline(&self.pipeline)?;

        let mut status: HashMap<String, StageStatus> = finished
            .iter()
            .filter(|(_, run)| run.status.is_success())
            .map(|(name, run)| (name.clone(), run.status))
            .collect();

        let mut pending: Vec<&StageDefinition> = self
            .pipeline
            .stages
            .iter()
            .filter(|s| !status.contains_key(&s.name))
            .collect();

        if pending.is_empty() {
            return Ok(ScheduleOutcome::Completed);
        }

        info!(stages = pending.len(), resumed = status.len(), "Scheduling stages");

        let mut tasks: JoinSet<(String, OrchestratorResult<StageRun>)> = JoinSet::new();
        let mut running = 0usize;
        let mut exclusive = false;
        let mut failure: Option<(String, OrchestratorError)> = None;
        let mut aborted = false;

        loop {
            if failure.is_none() && !*cancel.borrow() {
                while let Some(pos) = self.next_launchable(&pending, &status, running, exclusive) {
                    let stage = pending.remove(pos);
                    if !stage.parallel {
                        exclusive = true;
                    }
                    running += 1;
                    status.insert(stage.name.clone(), StageStatus::Running);
                    debug!(stage = %stage.name, parallel = stage.parallel, "Launching stage");

                    let task = self.stage_task(change, stage, cancel.clone())?;
                    let name = stage.name.clone();
                    tasks.spawn(async move { (name, task.await) });

                    if exclusive {
                        break;
                    }
                }
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            running = running.saturating_sub(1);

            let (name, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "Stage task panicked");
                    exclusive = false;
                    if failure.is_none() {
                        failure = Some((
                            "<unknown>".to_string(),
                            OrchestratorError::Internal(anyhow!("stage task failed: {}", e)),
                        ));
                    }
                    continue;
                }
            };

            if self
                .pipeline
                .get_stage(&name)
                .map_or(false, |s| !s.parallel)
            {
                exclusive = false;
            }

            match result {
                Ok(run) => {
                    status.insert(name.clone(), run.status);
                    match run.status {
                        StageStatus::Passed => info!(stage = %name, attempts = run.attempts, "Stage passed"),
                        StageStatus::Aborted => {
                            info!(stage = %name, "Stage aborted");
                            aborted = true;
                        }
                        _ => {
                            warn!(stage = %name, status = %run.status, error = ?run.error, "Stage failed");
                            if failure.is_none() {
                                failure = Some((name.clone(), stage_error(&run)));
                            }
                        }
                    }
                }
                Err(e) => {
                    error!(stage = %name, error = %e, "Stage could not be recorded");
                    status.insert(name.clone(), StageStatus::Failed);
                    if failure.is_none() {
                        failure = Some((name, e));
                    }
                }
            }
        }

        if aborted || *cancel.borrow() {
            if let Some((stage, error)) = &failure {
                info!(%stage, error = %error, "Abort supersedes stage failure");
            }
            return Ok(ScheduleOutcome::Aborted {
                halted_by: failure.map(|(_, error)| error.to_string()),
            });
        }

        if let Some((stage, error)) = failure {
            let skipped: Vec<&str> = pending.iter().map(|s| s.name.as_str()).collect();
            warn!(%stage, ?skipped, "Pipeline halted");
            return Ok(ScheduleOutcome::Failed { stage, error });
        }

        if !pending.is_empty() {
            let names: Vec<&str> = pending.iter().map(|s| s.name.as_str()).collect();
            return Err(OrchestratorError::Internal(anyhow!(
                "stages never became ready: {}",
                names.join(", ")
            )));
        }

        Ok(ScheduleOutcome::Completed)
    }

    /// Index in `pending` of the first stage that may launch now
    fn next_launchable(
        &self,
        pending: &[&StageDefinition],
        status: &HashMap<String, StageStatus>,
        running: usize,
        exclusive: bool,
    ) -> Option<usize> {
        if exclusive {
            return None;
        }

        for (i, stage) in pending.iter().enumerate() {
            let ready = self
                .pipeline
                .dependencies_of(stage)
                .iter()
                .all(|dep| status.get(*dep).map_or(false, |s| s.is_success()));

            if !ready {
                continue;
            }

            if !stage.parallel && running > 0 {
                // Hold later launches until the pipeline drains
                return None;
            }

            return Some(i);
        }

        None
    }

    fn stage_task(
        &self,
        change: &Change,
        stage: &StageDefinition,
        cancel: watch::Receiver<bool>,
    ) -> OrchestratorResult<impl std::future::Future<Output = OrchestratorResult<StageRun>> + Send + 'static>
    {
        let tool = self
            .tools
            .get(&stage.tool)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownStage(stage.name.clone()))?;

        let runner = StageRunner {
            change_id: change.id,
            revision: change.revision.clone(),
            stage: stage.clone(),
            timeout: stage.timeout(self.pipeline.default_timeout_seconds),
            tool,
            chain: self.chain.clone(),
            clock: self.clock.clone(),
            on_append: self.on_append.clone(),
        };

        Ok(runner.run(cancel))
    }
}

/// Error describing a stage's final failure
fn stage_error(run: &StageRun) -> OrchestratorError {
    match run.failure {
        Some(FailureKind::PolicyViolation) => OrchestratorError::PolicyViolation {
            stage: run.stage.clone(),
            breaches: if run.breaches.is_empty() {
                run.error.clone().unwrap_or_default()
            } else {
                run.breach_summary()
            },
        },
        _ => OrchestratorError::StageExecutionFailure {
            stage: run.stage.clone(),
            attempts: run.attempts,
            message: run.error.clone().unwrap_or_default(),
        },
    }
}

/// Resolves once cancellation is requested; never if the sender is gone
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    if cancel.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Everything one stage task needs, owned
struct StageRunner {
    change_id: Uuid,
    revision: String,
    stage: StageDefinition,
    timeout: std::time::Duration,
    tool: Tool,
    chain: Arc<AttestationChain>,
    clock: Arc<dyn Clock>,
    on_append: Option<AppendHook>,
}

impl StageRunner {
    async fn run(self, mut cancel: watch::Receiver<bool>) -> OrchestratorResult<StageRun> {
        let mut run = StageRun::pending(&self.stage.name);
        run.status = StageStatus::Running;
        run.started_at = Some(self.clock.now());

        let mut attempt = 0u32;

        loop {
            attempt += 1;
            run.attempts = attempt;

            if *cancel.borrow() {
                run.status = StageStatus::Aborted;
                break;
            }

            let request = StageRequest {
                change_id: self.change_id,
                revision: self.revision.clone(),
                stage: self.stage.name.clone(),
                tool: self.stage.tool.clone(),
                kind: self.stage.kind,
                attempt,
            };

            let (kind, message) = match tokio::time::timeout(self.timeout, self.tool.invoke(&request)).await {
                Ok(Ok(result)) => {
                    if *cancel.borrow() {
                        run.result = Some(result);
                        run.status = StageStatus::Aborted;
                        break;
                    }

                    let decision = evaluate_stage(&self.stage, &result);
                    run.result = Some(result);
                    match decision {
                        PolicyDecision::Pass => run.status = StageStatus::Passed,
                        PolicyDecision::Blocked { reason } => {
                            run.status = StageStatus::Blocked;
                            run.failure = Some(FailureKind::PolicyViolation);
                            run.error = Some(reason);
                        }
                        decision => {
                            run.status = StageStatus::Failed;
                            run.failure = Some(FailureKind::PolicyViolation);
                            run.error = decision.reason();
                            run.breaches = decision.breaches().to_vec();
                        }
                    }
                    break;
                }
                Ok(Err(e)) => (FailureKind::Execution, format!("{:#}", e)),
                Err(_) => (
                    FailureKind::Timeout,
                    format!("timed out after {}s", self.timeout.as_secs()),
                ),
            };

            if self.stage.should_retry(attempt) {
                let delay = self.stage.retry_policy.delay_for_attempt(attempt);
                warn!(
                    stage = %self.stage.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %message,
                    "Stage attempt failed, retrying"
                );

                tokio::select! {
                    _ = tokio::time::sleep(delay) => continue,
                    _ = cancelled(&mut cancel) => {
                        run.status = StageStatus::Aborted;
                        run.error = Some(message);
                        break;
                    }
                }
            }

            run.status = StageStatus::Failed;
            run.failure = Some(kind);
            run.error = Some(message);
            break;
        }

        run.finished_at = Some(self.clock.now());

        let attestation = self
            .chain
            .append(
                self.change_id,
                AttestationPayload::StageCompleted { run: run.clone() },
            )
            .await?;

        if let Some(hook) = &self.on_append {
            hook(&attestation);
        }

        run.attestation_hash = Some(attestation.hash);
        Ok(run)
    }
}
