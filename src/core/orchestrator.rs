//! Main orchestrator for approval-gated pipeline runs.
//!
//! Binds the gate engine, scheduler, policy evaluator and attestation
//! chain behind the per-Change state machine:
//!
//! ```text
//! awaiting_approval ─► approved ─► executing ─► deployed
//!        │                 ▲           │
//!        ├─► rejected ─────┘           ├─► blocked ─► executing (resume)
//!        └─► expired                   └─► aborted
//! ```
//!
//! Every transition is an attestation; the cached `PipelineRun` is only a
//! projection of the chain and is rebuilt whenever the ledger moved past it.
//! Check-then-append operations hold the Change's ledger lock, so several
//! orchestrators may share one home directory.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::adapters::{EventSink, ToolRegistry};
use crate::domain::{
    risk_message, ApprovalRecord, Attestation, AttestationPayload, Change, ChangeState,
    FailureKind, OverrideRecord, PipelineEvent, PipelineRun, RiskException, StageRun,
    StageStatus, Tier,
};

use super::approvals::{
    check_approval, check_override, ApprovalOutcome, ApprovalRequest, ApproverRoster, GateCheck,
    OverrideTarget,
};
use super::chain::{AttestationChain, AttestationSigner, ChainVerification, KeyRing};
use super::clock::{Clock, SystemClock};
use super::error::{OrchestratorError, OrchestratorResult};
use super::ledger::{ChangeLock, Ledger};
use super::pipeline::PipelineDefinition;
use super::policy::{apply_risk_acceptance, PolicyDecision, RiskAcceptance};
use super::scheduler::{ScheduleOutcome, StageScheduler};

/// Cached projections plus the observers fed from each append
struct Projections {
    runs: Mutex<HashMap<Uuid, PipelineRun>>,
    sinks: Vec<Arc<dyn EventSink>>,
    waiters: Mutex<HashMap<Uuid, Arc<Notify>>>,
}

impl Projections {
    fn publish(&self, attestation: &Attestation) {
        {
            let mut runs = self.runs.lock();
            if let Some(run) = runs.get_mut(&attestation.change_id) {
                if attestation.index == run.chain_length {
                    run.apply(attestation);
                } else if attestation.index > run.chain_length {
                    // A concurrent append landed first; rebuild on next read
                    runs.remove(&attestation.change_id);
                }
            }
        }

        let event = PipelineEvent::from_attestation(attestation);
        for sink in &self.sinks {
            sink.emit(&event);
        }

        if let Some(notify) = self.waiters.lock().get(&attestation.change_id) {
            notify.notify_waiters();
        }
    }

    fn waiter(&self, change_id: Uuid) -> Arc<Notify> {
        self.waiters.lock().entry(change_id).or_default().clone()
    }
}

struct CancelHandle {
    tx: watch::Sender<bool>,
    reason: Option<String>,
}

/// How often a waiting or executing run re-reads its ledger for links
/// appended by other processes
const DEFAULT_LEDGER_POLL: Duration = Duration::from_millis(250);

/// Hold on one Change's operations, in this process and across processes
struct ChangeGuard {
    _ledger: ChangeLock,
    _local: tokio::sync::OwnedMutexGuard<()>,
}

/// Status of one Change, ready for display
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub run: PipelineRun,

    /// Every pipeline stage in declaration order with its effective status
    pub stages: Vec<(String, StageStatus)>,

    pub verification: ChainVerification,

    /// What is holding the Change, if anything
    pub blocking: Option<String>,
}

impl std::fmt::Display for StatusReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let change = &self.run.change;
        writeln!(f, "Change:    {}", change.id)?;
        writeln!(f, "Revision:  {}", change.revision)?;
        writeln!(f, "Submitter: {}", change.submitted_by)?;
        writeln!(f, "Pipeline:  {}", self.run.pipeline)?;
        writeln!(f, "State:     {}", change.state)?;

        writeln!(f, "\nApprovals:")?;
        for tier in Tier::ALL {
            match self.run.tier_record(tier) {
                Some(record) => {
                    let overridden = if self.run.is_overridden(tier) {
                        " (overridden)"
                    } else {
                        ""
                    };
                    writeln!(
                        f,
                        "  {:<20} {} by {}{}",
                        tier.as_str(),
                        record.decision,
                        record.approver,
                        overridden
                    )?;
                    if let Some(note) = &record.note {
                        writeln!(f, "  {:<20} note: {}", "", note)?;
                    }
                }
                None => writeln!(f, "  {:<20} pending", tier.as_str())?,
            }
        }

        writeln!(f, "\nStages:")?;
        for (name, status) in &self.stages {
            let mut line = format!("  {:<20} {}", name, status);
            if let Some(run) = self.run.stages.get(name) {
                if run.attempts > 1 {
                    line.push_str(&format!(" ({} attempts)", run.attempts));
                }
                if !run.breaches.is_empty() {
                    line.push_str(&format!(" [{}]", run.breach_summary()));
                } else if let Some(error) = &run.error {
                    line.push_str(&format!(" [{}]", error));
                }
                if let Some(exception) = &run.exception {
                    line.push_str(&format!(" accepted by {}: {}", exception.accepted_by, exception.note));
                }
            }
            writeln!(f, "{}", line)?;
        }

        if let Some(blocking) = &self.blocking {
            writeln!(f, "\nBlocked:   {}", blocking)?;
        }
        if let Some(reason) = &self.run.abort_requested {
            writeln!(f, "\nAbort:     requested ({})", reason)?;
        }
        write!(f, "\nChain:     {}", self.verification)
    }
}

/// Configures and builds an `Orchestrator`
pub struct OrchestratorBuilder {
    pipeline: PipelineDefinition,
    ledger: Option<Ledger>,
    roster: ApproverRoster,
    tools: ToolRegistry,
    signer: Option<AttestationSigner>,
    keyring: KeyRing,
    clock: Arc<dyn Clock>,
    approval_timeout: Option<chrono::Duration>,
    ledger_poll: Duration,
    sinks: Vec<Arc<dyn EventSink>>,
}

impl OrchestratorBuilder {
    pub fn new(pipeline: PipelineDefinition) -> Self {
        Self {
            pipeline,
            ledger: None,
            roster: ApproverRoster::new(),
            tools: ToolRegistry::new(),
            signer: None,
            keyring: KeyRing::new(),
            clock: Arc::new(SystemClock),
            approval_timeout: None,
            ledger_poll: DEFAULT_LEDGER_POLL,
            sinks: Vec::new(),
        }
    }

    pub fn ledger(mut self, ledger: Ledger) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn roster(mut self, roster: ApproverRoster) -> Self {
        self.roster = roster;
        self
    }

    pub fn tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }

    pub fn signer(mut self, signer: AttestationSigner) -> Self {
        self.signer = Some(signer);
        self
    }

    /// Additional trusted keys, e.g. earlier orchestrator keys
    pub fn keyring(mut self, keyring: KeyRing) -> Self {
        self.keyring = keyring;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn approval_timeout(mut self, timeout: chrono::Duration) -> Self {
        self.approval_timeout = Some(timeout);
        self
    }

    pub fn ledger_poll_interval(mut self, interval: Duration) -> Self {
        self.ledger_poll = interval;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> OrchestratorResult<Orchestrator> {
        self.pipeline.validate()?;

        let ledger = match self.ledger {
            Some(ledger) => ledger,
            None => Ledger::open_default()?,
        };
        let signer = Arc::new(self.signer.unwrap_or_else(AttestationSigner::generate));
        let chain = AttestationChain::new(signer, self.keyring, ledger, self.clock.clone());

        Ok(Orchestrator {
            pipeline: Arc::new(self.pipeline),
            roster: self.roster,
            tools: Arc::new(self.tools),
            chain: Arc::new(chain),
            clock: self.clock,
            approval_timeout: self.approval_timeout,
            ledger_poll: self.ledger_poll,
            projections: Arc::new(Projections {
                runs: Mutex::new(HashMap::new()),
                sinks: self.sinks,
                waiters: Mutex::new(HashMap::new()),
            }),
            operations: Mutex::new(HashMap::new()),
            cancels: Mutex::new(HashMap::new()),
        })
    }
}

/// Approval-gated pipeline orchestrator
pub struct Orchestrator {
    pipeline: Arc<PipelineDefinition>,
    roster: ApproverRoster,
    tools: Arc<ToolRegistry>,
    chain: Arc<AttestationChain>,
    clock: Arc<dyn Clock>,
    approval_timeout: Option<chrono::Duration>,
    ledger_poll: Duration,
    projections: Arc<Projections>,

    /// Serializes this process's operations per Change ahead of the ledger lock
    operations: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,

    /// Cancellation signals of executing runs
    cancels: Mutex<HashMap<Uuid, CancelHandle>>,
}

impl Orchestrator {
    pub fn builder(pipeline: PipelineDefinition) -> OrchestratorBuilder {
        OrchestratorBuilder::new(pipeline)
    }

    pub fn pipeline(&self) -> &PipelineDefinition {
        &self.pipeline
    }

    pub fn chain(&self) -> &AttestationChain {
        &self.chain
    }

    pub fn roster(&self) -> &ApproverRoster {
        &self.roster
    }

    fn operation_lock(&self, change_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.operations.lock().entry(change_id).or_default().clone()
    }

    async fn lock_change(&self, change_id: Uuid) -> OrchestratorResult<ChangeGuard> {
        if !self.chain.ledger().exists(change_id) {
            return Err(OrchestratorError::ChangeNotFound(change_id));
        }
        let local = self.operation_lock(change_id).lock_owned().await;
        let ledger = self.chain.ledger().lock_change(change_id).await?;
        Ok(ChangeGuard {
            _ledger: ledger,
            _local: local,
        })
    }

    /// Cancel this process's execution of a Change, if it has one
    fn signal_abort(&self, change_id: Uuid, reason: &str) -> bool {
        match self.cancels.lock().get_mut(&change_id) {
            Some(handle) => {
                if handle.reason.is_none() {
                    info!(%change_id, %reason, "Cancelling executing run");
                    handle.reason = Some(reason.to_string());
                }
                let _ = handle.tx.send(true);
                true
            }
            None => false,
        }
    }

    async fn append(
        &self,
        change_id: Uuid,
        payload: AttestationPayload,
    ) -> OrchestratorResult<Attestation> {
        let attestation = self.chain.append(change_id, payload).await?;
        self.projections.publish(&attestation);
        Ok(attestation)
    }

    async fn transition(
        &self,
        change_id: Uuid,
        state: ChangeState,
        reason: Option<String>,
    ) -> OrchestratorResult<Attestation> {
        info!(%change_id, state = %state, reason = ?reason, "Change state transition");
        self.append(change_id, AttestationPayload::Lifecycle { state, reason })
            .await
    }

    /// Attest a refused request and hand the error back.
    ///
    /// Sealed Changes, broken chains and expiries (already attested by
    /// their lifecycle link) are only logged.
    async fn record_denial(
        &self,
        run: &PipelineRun,
        operation: String,
        actor: Option<&str>,
        error: OrchestratorError,
    ) -> OrchestratorError {
        let change_id = run.change.id;
        warn!(%change_id, %operation, actor = ?actor, error = %error, "Request denied");

        let attested = !run.change.state.is_sealed()
            && !matches!(
                error,
                OrchestratorError::ChainVerificationFailure { .. }
                    | OrchestratorError::TimeoutExpired { .. }
                    | OrchestratorError::ChangeNotFound(_)
                    | OrchestratorError::Internal(_)
            );
        if !attested {
            return error;
        }

        let payload = AttestationPayload::RequestDenied {
            operation,
            actor: actor.map(String::from),
            reason: error.to_string(),
            exit_code: error.exit_code(),
        };
        if let Err(e) = self.append(change_id, payload).await {
            warn!(%change_id, error = %e, "Failed to attest denied request");
        }
        error
    }

    /// Load a run, replaying its chain unless the cached projection is at
    /// the ledger's head
    async fn load_run(&self, change_id: Uuid) -> OrchestratorResult<PipelineRun> {
        let attestations = self.chain.attestations(change_id).await?;
        let Some(last) = attestations.last() else {
            return Err(OrchestratorError::ChangeNotFound(change_id));
        };

        if let Some(run) = self.projections.runs.lock().get(&change_id) {
            if run.chain_length == attestations.len() as u64
                && run.chain_head.as_deref() == Some(last.hash.as_str())
            {
                return Ok(run.clone());
            }
        }

        let run = PipelineRun::from_attestations(&attestations).ok_or_else(|| {
            OrchestratorError::Internal(anyhow!(
                "ledger for change {} does not begin with a submission",
                change_id
            ))
        })?;

        debug!(%change_id, links = attestations.len(), "Run rebuilt from chain");
        self.projections.runs.lock().insert(change_id, run.clone());
        Ok(run)
    }

    /// When the approval window of a waiting Change closes
    fn approval_deadline(&self, run: &PipelineRun) -> Option<DateTime<Utc>> {
        match run.change.state {
            ChangeState::AwaitingApproval => self
                .approval_timeout
                .map(|timeout| run.change.submitted_at + timeout),
            _ => None,
        }
    }

    /// Expire the Change if its approval window has closed
    async fn expire_if_due(&self, run: &PipelineRun) -> OrchestratorResult<()> {
        let change_id = run.change.id;

        if run.change.state == ChangeState::Expired {
            return Err(OrchestratorError::TimeoutExpired {
                change_id,
                what: "approvals".to_string(),
            });
        }

        if let Some(deadline) = self.approval_deadline(run) {
            if self.clock.now() >= deadline {
                warn!(%change_id, %deadline, "Approval window elapsed");
                self.transition(
                    change_id,
                    ChangeState::Expired,
                    Some(format!("approvals not complete by {}", deadline.to_rfc3339())),
                )
                .await?;
                return Err(OrchestratorError::TimeoutExpired {
                    change_id,
                    what: "approvals".to_string(),
                });
            }
        }

        Ok(())
    }

    /// Create a Change and its run; the first attestation records the submission
    #[instrument(skip(self, revision, submitted_by))]
    pub async fn submit_change(
        &self,
        revision: impl Into<String>,
        submitted_by: impl Into<String>,
    ) -> OrchestratorResult<PipelineRun> {
        let change = Change::new(revision, submitted_by, self.clock.now());
        let change_id = change.id;

        let attestation = self
            .chain
            .append(
                change_id,
                AttestationPayload::ChangeSubmitted {
                    revision: change.revision.clone(),
                    submitted_by: change.submitted_by.clone(),
                    pipeline: self.pipeline.name.clone(),
                    submitted_at: change.submitted_at,
                },
            )
            .await?;

        let mut run = PipelineRun::new(change, self.pipeline.name.clone());
        run.apply(&attestation);
        self.projections.runs.lock().insert(change_id, run.clone());
        self.projections.publish(&attestation);

        info!(%change_id, revision = %run.change.revision, "Change submitted");
        Ok(run)
    }

    /// Record one tier's decision
    #[instrument(skip(self, request), fields(change_id = %request.change_id, tier = %request.tier, approver = %request.approver))]
    pub async fn submit_approval(&self, request: ApprovalRequest) -> OrchestratorResult<ApprovalOutcome> {
        let _guard = self.lock_change(request.change_id).await?;

        let run = self.load_run(request.change_id).await?;
        self.expire_if_due(&run).await?;

        let check = match check_approval(&run, &self.roster, &request) {
            Ok(check) => check,
            Err(e) => {
                let operation = format!("approval:{}", request.tier.as_str());
                return Err(self
                    .record_denial(&run, operation, Some(&request.approver), e)
                    .await);
            }
        };

        match check {
            GateCheck::Duplicate(existing) => {
                debug!("Identical approval already recorded");
                Ok(ApprovalOutcome::AlreadyRecorded(existing))
            }
            GateCheck::Accept => {
                let record = ApprovalRecord {
                    change_id: request.change_id,
                    tier: request.tier,
                    approver: request.approver,
                    decision: request.decision,
                    recorded_at: self.clock.now(),
                    note: request.note,
                    signature: request.signature,
                };

                self.append(
                    request.change_id,
                    AttestationPayload::ApprovalRecorded {
                        record: record.clone(),
                    },
                )
                .await?;

                info!(decision = %record.decision, "Approval recorded");
                Ok(ApprovalOutcome::Recorded(record))
            }
        }
    }

    /// True only when all tiers are satisfied in order and nothing is rejected
    pub async fn is_ready_for_execution(&self, change_id: Uuid) -> OrchestratorResult<bool> {
        let run = self.load_run(change_id).await?;
        Ok(run.change.state == ChangeState::Approved && run.is_ready_for_execution())
    }

    /// Wait until the Change is ready, rejected, or its approval window closes
    #[instrument(skip(self))]
    pub async fn await_approval(&self, change_id: Uuid) -> OrchestratorResult<PipelineRun> {
        let notify = self.projections.waiter(change_id);

        loop {
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let run = self.load_run(change_id).await?;
            match run.change.state {
                ChangeState::Approved if run.is_ready_for_execution() => return Ok(run),
                ChangeState::AwaitingApproval => {}
                ChangeState::Rejected => {
                    return Err(OrchestratorError::ChangeRejected {
                        change_id,
                        reason: run.block_reason.unwrap_or_else(|| "rejected".to_string()),
                    })
                }
                ChangeState::Expired => {
                    return Err(OrchestratorError::TimeoutExpired {
                        change_id,
                        what: "approvals".to_string(),
                    })
                }
                state => return Err(OrchestratorError::ChangeClosed { change_id, state }),
            }

            // Decisions recorded by other processes only show up in the ledger
            let mut wait = self.ledger_poll;
            if let Some(deadline) = self.approval_deadline(&run) {
                let remaining = (deadline - self.clock.now())
                    .to_std()
                    .unwrap_or(Duration::ZERO);

                if remaining.is_zero() {
                    let _guard = self.lock_change(change_id).await?;
                    let run = self.load_run(change_id).await?;
                    self.expire_if_due(&run).await?;
                    continue;
                }
                wait = wait.min(remaining);
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Expire every waiting Change whose approval window has closed
    pub async fn expire_overdue(&self) -> OrchestratorResult<Vec<Uuid>> {
        let mut expired = Vec::new();

        for change_id in self.chain.ledger().list_changes().await? {
            let _guard = self.lock_change(change_id).await?;

            let run = self.load_run(change_id).await?;
            if run.change.state != ChangeState::AwaitingApproval {
                continue;
            }
            if let Err(OrchestratorError::TimeoutExpired { .. }) = self.expire_if_due(&run).await {
                expired.push(change_id);
            }
        }

        Ok(expired)
    }

    /// Execute (or resume) the pipeline for an approved Change
    #[instrument(skip(self), fields(pipeline = %self.pipeline.name))]
    pub async fn run_pipeline(&self, change_id: Uuid) -> OrchestratorResult<PipelineRun> {
        let (run, cancel) = {
            let _guard = self.lock_change(change_id).await?;

            let run = self.load_run(change_id).await?;
            self.chain.verify(change_id).await?.into_result(change_id)?;
            if let Err(e) = self.check_executable(&run).await {
                return Err(self.record_denial(&run, "run".to_string(), None, e).await);
            }

            let (tx, rx) = watch::channel(false);
            {
                let mut cancels = self.cancels.lock();
                if cancels.contains_key(&change_id) {
                    return Err(OrchestratorError::ChangeClosed {
                        change_id,
                        state: ChangeState::Executing,
                    });
                }
                cancels.insert(change_id, CancelHandle { tx, reason: None });
            }

            if let Err(e) = self.transition(change_id, ChangeState::Executing, None).await {
                self.cancels.lock().remove(&change_id);
                return Err(e);
            }
            (run, rx)
        };

        info!(%change_id, resumed = !run.stages.is_empty(), "Executing pipeline");

        let projections = self.projections.clone();
        let scheduler = StageScheduler::new(
            self.pipeline.clone(),
            self.tools.clone(),
            self.chain.clone(),
            self.clock.clone(),
        )
        .on_append(Arc::new(move |attestation: &Attestation| {
            projections.publish(attestation)
        }));

        let outcome = {
            let scheduled = scheduler.run(&run.change, &run.stages, cancel);
            tokio::pin!(scheduled);
            loop {
                tokio::select! {
                    outcome = &mut scheduled => break outcome,
                    _ = tokio::time::sleep(self.ledger_poll) => self.poll_abort_request(change_id).await,
                }
            }
        };
        let abort_reason = self
            .cancels
            .lock()
            .remove(&change_id)
            .and_then(|handle| handle.reason);

        let _guard = self.lock_change(change_id).await?;
        let requested = match abort_reason {
            Some(reason) => Some(reason),
            None => self.load_run(change_id).await?.abort_requested,
        };

        match outcome {
            Ok(ScheduleOutcome::Completed) => {
                if let Some(reason) = &requested {
                    warn!(%change_id, %reason, "Abort requested after the last stage finished");
                }
                self.transition(change_id, ChangeState::Deployed, None).await?;
                info!(%change_id, "Pipeline deployed");
                self.load_run(change_id).await
            }
            Ok(ScheduleOutcome::Aborted { halted_by }) => {
                self.finish_aborted(change_id, requested, halted_by).await
            }
            Ok(ScheduleOutcome::Failed { error, .. }) if requested.is_some() => {
                self.finish_aborted(change_id, requested, Some(error.to_string()))
                    .await
            }
            Ok(ScheduleOutcome::Failed { error, .. }) => {
                self.transition(change_id, ChangeState::Blocked, Some(error.to_string()))
                    .await?;
                Err(error)
            }
            Err(error) => {
                self.transition(change_id, ChangeState::Blocked, Some(error.to_string()))
                    .await?;
                Err(error)
            }
        }
    }

    /// Seal an aborted run, keeping any stage failure seen before the abort
    async fn finish_aborted(
        &self,
        change_id: Uuid,
        requested: Option<String>,
        halted_by: Option<String>,
    ) -> OrchestratorResult<PipelineRun> {
        let mut reason = requested.unwrap_or_else(|| "aborted".to_string());
        if let Some(failure) = halted_by {
            reason = format!("{}; {}", reason, failure);
        }
        self.transition(change_id, ChangeState::Aborted, Some(reason))
            .await?;
        self.load_run(change_id).await
    }

    /// Pick up an abort recorded by another process
    async fn poll_abort_request(&self, change_id: Uuid) {
        match self.load_run(change_id).await {
            Ok(run) => {
                if let Some(reason) = run.abort_requested {
                    self.signal_abort(change_id, &reason);
                }
            }
            Err(e) => debug!(%change_id, error = %e, "Ledger poll failed"),
        }
    }

    /// Whether the run may enter `executing` now
    async fn check_executable(&self, run: &PipelineRun) -> OrchestratorResult<()> {
        let change_id = run.change.id;

        match run.change.state {
            ChangeState::Approved if run.is_ready_for_execution() => Ok(()),
            ChangeState::Approved | ChangeState::AwaitingApproval => {
                self.expire_if_due(run).await?;
                let missing: Vec<&str> = Tier::ALL
                    .iter()
                    .filter(|t| !run.tier_satisfied(**t))
                    .map(|t| t.as_str())
                    .collect();
                Err(OrchestratorError::GateNotSatisfied {
                    change_id,
                    detail: format!("awaiting {} approval", missing.join(", ")),
                })
            }
            ChangeState::Blocked => {
                for stage in run.failed_stages() {
                    if stage.failure == Some(FailureKind::PolicyViolation) {
                        return Err(OrchestratorError::PolicyViolation {
                            stage: stage.stage.clone(),
                            breaches: if stage.breaches.is_empty() {
                                stage.error.clone().unwrap_or_default()
                            } else {
                                stage.breach_summary()
                            },
                        });
                    }
                }
                Ok(())
            }
            ChangeState::Rejected => Err(OrchestratorError::ChangeRejected {
                change_id,
                reason: run
                    .block_reason
                    .clone()
                    .unwrap_or_else(|| "rejected".to_string()),
            }),
            ChangeState::Expired => Err(OrchestratorError::TimeoutExpired {
                change_id,
                what: "approvals".to_string(),
            }),
            state => Err(OrchestratorError::ChangeClosed { change_id, state }),
        }
    }

    /// Abort a Change. An executing run is only asked to stop: the request
    /// is attested and the executing process, wherever it runs, seals the
    /// Change once its stages have wound down.
    #[instrument(skip(self, reason))]
    pub async fn abort(&self, change_id: Uuid, reason: impl Into<String>) -> OrchestratorResult<PipelineRun> {
        let reason = reason.into();
        let _guard = self.lock_change(change_id).await?;

        let run = self.load_run(change_id).await?;
        if run.is_terminal() {
            return Err(OrchestratorError::ChangeClosed {
                change_id,
                state: run.change.state,
            });
        }

        if run.change.state == ChangeState::Executing {
            if run.abort_requested.is_none() {
                self.append(
                    change_id,
                    AttestationPayload::AbortRequested {
                        reason: reason.clone(),
                    },
                )
                .await?;
            }
            let local = self.signal_abort(change_id, &reason);
            info!(%change_id, %reason, local, "Abort requested for executing run");
            return self.load_run(change_id).await;
        }

        self.transition(change_id, ChangeState::Aborted, Some(reason))
            .await?;
        self.load_run(change_id).await
    }

    /// Mission-owner acceptance of a policy-failed stage
    #[instrument(skip(self, acceptance), fields(change_id = %acceptance.change_id, stage = %acceptance.stage))]
    pub async fn accept_risk(&self, acceptance: RiskAcceptance) -> OrchestratorResult<PipelineRun> {
        let change_id = acceptance.change_id;
        let _guard = self.lock_change(change_id).await?;

        let run = self.load_run(change_id).await?;
        let stage_run = match self.check_risk_acceptance(&run, &acceptance) {
            Ok(stage_run) => stage_run,
            Err(e) => {
                let operation = format!("risk_acceptance:{}", acceptance.stage);
                return Err(self
                    .record_denial(&run, operation, Some(&acceptance.approver), e)
                    .await);
            }
        };

        let decision = apply_risk_acceptance(
            PolicyDecision::Fail {
                breaches: stage_run.breaches.clone(),
            },
            &acceptance,
        );

        let exception = RiskException {
            accepted_by: acceptance.approver.clone(),
            note: acceptance.note.clone(),
            original_attestation: stage_run.attestation_hash.clone().unwrap_or_default(),
            recorded_at: self.clock.now(),
        };

        self.append(
            change_id,
            AttestationPayload::RiskAccepted {
                stage: acceptance.stage.clone(),
                breaches: decision.breaches().to_vec(),
                exception,
                signature: acceptance.signature,
            },
        )
        .await?;

        info!(approver = %acceptance.approver, "Risk accepted");
        self.load_run(change_id).await
    }

    fn check_risk_acceptance<'a>(
        &self,
        run: &'a PipelineRun,
        acceptance: &RiskAcceptance,
    ) -> OrchestratorResult<&'a StageRun> {
        let change_id = run.change.id;
        if run.change.state != ChangeState::Blocked {
            return Err(OrchestratorError::ChangeClosed {
                change_id,
                state: run.change.state,
            });
        }

        self.roster
            .require_entitled(&acceptance.approver, Tier::MissionOwner)?;
        self.roster.check_signature(
            &acceptance.approver,
            &risk_message(change_id, &acceptance.stage),
            &acceptance.signature,
        )?;

        if acceptance.note.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "a risk acceptance must document its justification".to_string(),
            ));
        }

        let stage_run = run
            .stages
            .get(&acceptance.stage)
            .ok_or_else(|| OrchestratorError::UnknownStage(acceptance.stage.clone()))?;

        let policy_failed = matches!(stage_run.status, StageStatus::Failed | StageStatus::Blocked)
            && stage_run.failure == Some(FailureKind::PolicyViolation);
        if !policy_failed {
            return Err(OrchestratorError::InvalidRequest(format!(
                "stage '{}' is {} and has no policy failure to accept",
                acceptance.stage, stage_run.status
            )));
        }

        Ok(stage_run)
    }

    /// Reopen a rejected Change under mission-owner authority
    #[instrument(skip(self, reason, signature))]
    pub async fn emergency_override(
        &self,
        change_id: Uuid,
        authority: &str,
        reason: &str,
        signature: &str,
    ) -> OrchestratorResult<PipelineRun> {
        let _guard = self.lock_change(change_id).await?;

        let run = self.load_run(change_id).await?;
        let target = match self.check_emergency_override(&run, authority, reason, signature) {
            Ok(target) => target,
            Err(e) => {
                return Err(self
                    .record_denial(&run, "emergency_override".to_string(), Some(authority), e)
                    .await);
            }
        };

        self.append(
            change_id,
            AttestationPayload::RejectionOverridden {
                record: OverrideRecord {
                    tier: target.tier,
                    original_approver: target.original_approver,
                    reason: reason.to_string(),
                    authority: authority.to_string(),
                    recorded_at: self.clock.now(),
                },
                signature: signature.to_string(),
            },
        )
        .await?;

        warn!(%change_id, %authority, tier = %target.tier, "Rejection overridden");
        self.load_run(change_id).await
    }

    fn check_emergency_override(
        &self,
        run: &PipelineRun,
        authority: &str,
        reason: &str,
        signature: &str,
    ) -> OrchestratorResult<OverrideTarget> {
        if run.change.state != ChangeState::Rejected {
            return Err(OrchestratorError::ChangeClosed {
                change_id: run.change.id,
                state: run.change.state,
            });
        }
        if reason.trim().is_empty() {
            return Err(OrchestratorError::InvalidRequest(
                "an emergency override must state its reason".to_string(),
            ));
        }

        check_override(run, &self.roster, authority, signature)
    }

    /// Current run with stage statuses and chain verification
    pub async fn status(&self, change_id: Uuid) -> OrchestratorResult<StatusReport> {
        let run = self.load_run(change_id).await?;
        let verification = self.chain.verify(change_id).await?;

        let stages = self
            .pipeline
            .stages
            .iter()
            .map(|s| (s.name.clone(), run.stage_status(&s.name)))
            .collect();

        let blocking = match run.change.state {
            ChangeState::AwaitingApproval => {
                let missing: Vec<&str> = Tier::ALL
                    .iter()
                    .filter(|t| !run.tier_satisfied(**t))
                    .map(|t| t.as_str())
                    .collect();
                Some(format!("awaiting {} approval", missing.join(", ")))
            }
            ChangeState::Blocked | ChangeState::Rejected | ChangeState::Expired | ChangeState::Aborted => {
                run.block_reason.clone()
            }
            _ => None,
        };

        Ok(StatusReport {
            run,
            stages,
            verification,
            blocking,
        })
    }

    /// Verify the persisted chain of a Change
    pub async fn verify_chain(&self, change_id: Uuid) -> OrchestratorResult<ChainVerification> {
        if !self.chain.ledger().exists(change_id) {
            return Err(OrchestratorError::ChangeNotFound(change_id));
        }
        self.chain.verify(change_id).await
    }

    /// Every known run, oldest submission first
    pub async fn list_runs(&self) -> OrchestratorResult<Vec<PipelineRun>> {
        let mut runs = Vec::new();
        for change_id in self.chain.ledger().list_changes().await? {
            match self.load_run(change_id).await {
                Ok(run) => runs.push(run),
                Err(e) => warn!(%change_id, error = %e, "Skipping unreadable run"),
            }
        }
        runs.sort_by_key(|r| r.change.submitted_at);
        Ok(runs)
    }

    /// The attestations of a Change, in chain order
    pub async fn attestations(&self, change_id: Uuid) -> OrchestratorResult<Vec<Attestation>> {
        let attestations = self.chain.attestations(change_id).await?;
        if attestations.is_empty() {
            return Err(OrchestratorError::ChangeNotFound(change_id));
        }
        Ok(attestations)
    }
}
