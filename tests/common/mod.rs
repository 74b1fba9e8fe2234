//! Shared fixtures: scripted tools, an approver roster with real keys and
//! an orchestrator over a temporary ledger.

#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use uuid::Uuid;

use gatechain::adapters::{
    BuildExecutor, ChannelSink, ComplianceChecker, DeployExecutor, Scanner, StageRequest,
    ToolRegistry,
};
use gatechain::core::{
    ApprovalOutcome, ApprovalRequest, ApproverRoster, AttestationSigner, KeyRing, Ledger,
    ManualClock, Orchestrator, OrchestratorResult, PipelineDefinition,
};
use gatechain::domain::{
    approval_message, override_message, risk_message, ComplianceReport, Decision, ExecutionReport, ScanReport,
    Tier,
};

/// Three parallel security stages, then an exclusive build and deploy
pub const RELEASE_PIPELINE: &str = r#"
name: release
default_timeout_seconds: 30
stages:
  - name: sast
    kind: scan
    tool: semgrep
    group: security
    thresholds: { critical: 0, high: 0 }
  - name: sca
    kind: scan
    tool: snyk
    group: security
    thresholds: { critical: 0 }
  - name: compliance
    kind: compliance
    tool: opa
    group: security
  - name: build
    kind: build
    tool: builder
    parallel: false
    depends_on: [security]
    retry_policy: { max_attempts: 3, initial_delay_ms: 10, max_delay_ms: 50 }
  - name: deploy
    kind: deploy
    tool: deployer
    parallel: false
    depends_on: [build]
"#;

/// Ledger poll interval of test orchestrators
pub const LEDGER_POLL: Duration = Duration::from_millis(20);

/// Start/end order and peak concurrency of tool calls
#[derive(Debug, Default)]
pub struct CallLog {
    events: Mutex<Vec<String>>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl CallLog {
    fn start(&self, stage: &str) {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.events.lock().push(format!("start:{}", stage));
    }

    fn end(&self, stage: &str) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        self.events.lock().push(format!("end:{}", stage));
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }

    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn has_started(&self, stage: &str) -> bool {
        self.position(&format!("start:{}", stage)).is_some()
    }
}

/// A tool with a scripted outcome. Implements every adapter trait; it is
/// registered under whichever kind a stage needs.
#[derive(Debug)]
pub struct FakeTool {
    name: String,
    findings: ScanReport,
    success: bool,
    transient_failures: AtomicU32,
    delay: Duration,
    calls: AtomicU32,
    log: Arc<CallLog>,
}

impl FakeTool {
    pub fn new(name: &str, log: &Arc<CallLog>) -> Self {
        Self {
            name: name.to_string(),
            findings: ScanReport::default(),
            success: true,
            transient_failures: AtomicU32::new(0),
            delay: Duration::from_millis(5),
            calls: AtomicU32::new(0),
            log: log.clone(),
        }
    }

    pub fn with_findings(mut self, findings: ScanReport) -> Self {
        self.findings = findings;
        self
    }

    /// Non-compliant / unsuccessful report
    pub fn unsuccessful(mut self) -> Self {
        self.success = false;
        self
    }

    /// Return an adapter error for the first `n` calls
    pub fn failing_first(self, n: u32) -> Self {
        self.transient_failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    async fn perform(&self, request: &StageRequest) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.log.start(&request.stage);
        tokio::time::sleep(self.delay).await;
        self.log.end(&request.stage);

        let remaining = self.transient_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.transient_failures.store(remaining - 1, Ordering::SeqCst);
            bail!("{}: connection reset", self.name);
        }
        Ok(())
    }

    fn execution_report(&self, request: &StageRequest) -> ExecutionReport {
        ExecutionReport {
            success: self.success,
            reference: Some(format!("{}@{}", self.name, request.revision)),
        }
    }
}

#[async_trait]
impl Scanner for FakeTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn scan(&self, request: &StageRequest) -> Result<ScanReport> {
        self.perform(request).await?;
        Ok(self.findings.clone())
    }
}

#[async_trait]
impl ComplianceChecker for FakeTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn check(&self, request: &StageRequest) -> Result<ComplianceReport> {
        self.perform(request).await?;
        Ok(ComplianceReport {
            compliant: self.success,
            results_ref: None,
        })
    }
}

#[async_trait]
impl BuildExecutor for FakeTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn build(&self, request: &StageRequest) -> Result<ExecutionReport> {
        self.perform(request).await?;
        Ok(self.execution_report(request))
    }
}

#[async_trait]
impl DeployExecutor for FakeTool {
    fn name(&self) -> &str {
        &self.name
    }

    async fn deploy(&self, request: &StageRequest) -> Result<ExecutionReport> {
        self.perform(request).await?;
        Ok(self.execution_report(request))
    }
}

/// The tools of `RELEASE_PIPELINE`, all healthy unless replaced
pub struct Tools {
    pub log: Arc<CallLog>,
    pub sast: Arc<FakeTool>,
    pub sca: Arc<FakeTool>,
    pub compliance: Arc<FakeTool>,
    pub build: Arc<FakeTool>,
    pub deploy: Arc<FakeTool>,
}

impl Tools {
    pub fn healthy() -> Self {
        let log = Arc::new(CallLog::default());
        Self {
            sast: Arc::new(FakeTool::new("semgrep", &log)),
            sca: Arc::new(FakeTool::new("snyk", &log)),
            compliance: Arc::new(FakeTool::new("opa", &log)),
            build: Arc::new(FakeTool::new("builder", &log)),
            deploy: Arc::new(FakeTool::new("deployer", &log)),
            log,
        }
    }

    /// A fresh tool sharing this set's call log
    pub fn tool(&self, name: &str) -> FakeTool {
        FakeTool::new(name, &self.log)
    }

    pub fn registry(&self) -> ToolRegistry {
        ToolRegistry::new()
            .scanner("semgrep", self.sast.clone())
            .scanner("snyk", self.sca.clone())
            .compliance("opa", self.compliance.clone())
            .build("builder", self.build.clone())
            .deploy("deployer", self.deploy.clone())
    }

    pub fn total_calls(&self) -> u32 {
        [&self.sast, &self.sca, &self.compliance, &self.build, &self.deploy]
            .iter()
            .map(|t| t.calls())
            .sum()
    }
}

/// One approver per tier, plus a second peer
pub struct Approvers {
    pub alice: AttestationSigner,
    pub bob: AttestationSigner,
    pub grace: AttestationSigner,
    pub olivia: AttestationSigner,
}

impl Approvers {
    pub fn new() -> Self {
        Self {
            alice: AttestationSigner::generate(),
            bob: AttestationSigner::generate(),
            grace: AttestationSigner::generate(),
            olivia: AttestationSigner::generate(),
        }
    }

    pub fn roster(&self) -> ApproverRoster {
        let mut roster = ApproverRoster::new();
        roster
            .insert("alice", [Tier::Peer], Some(self.alice.verifying_key()))
            .insert("bob", [Tier::Peer], Some(self.bob.verifying_key()))
            .insert(
                "grace",
                [Tier::SecurityGatekeeper],
                Some(self.grace.verifying_key()),
            )
            .insert(
                "olivia",
                [Tier::MissionOwner],
                Some(self.olivia.verifying_key()),
            );
        roster
    }

    /// The default approver for a tier
    pub fn for_tier(&self, tier: Tier) -> (&'static str, &AttestationSigner) {
        match tier {
            Tier::Peer => ("alice", &self.alice),
            Tier::SecurityGatekeeper => ("grace", &self.grace),
            Tier::MissionOwner => ("olivia", &self.olivia),
        }
    }

    pub fn signer(&self, id: &str) -> &AttestationSigner {
        match id {
            "alice" => &self.alice,
            "bob" => &self.bob,
            "grace" => &self.grace,
            _ => &self.olivia,
        }
    }
}

/// An orchestrator over a temporary ledger with a manual clock
pub struct Harness {
    pub orchestrator: Arc<Orchestrator>,
    pub clock: Arc<ManualClock>,
    pub approvers: Approvers,
    pub events: ChannelSink,
    signer_secret: String,
    pipeline: String,
    temp: TempDir,
}

impl Harness {
    pub fn new(tools: &Tools) -> Self {
        Self::build(RELEASE_PIPELINE, tools, None)
    }

    pub fn with_pipeline(pipeline: &str, tools: &Tools) -> Self {
        Self::build(pipeline, tools, None)
    }

    pub fn with_approval_timeout(tools: &Tools, timeout: chrono::Duration) -> Self {
        Self::build(RELEASE_PIPELINE, tools, Some(timeout))
    }

    fn build(pipeline: &str, tools: &Tools, timeout: Option<chrono::Duration>) -> Self {
        let temp = TempDir::new().unwrap();
        let approvers = Approvers::new();
        let clock = Arc::new(ManualClock::default());
        let events = ChannelSink::new(256);
        let signer = AttestationSigner::generate();
        let signer_secret = signer.secret_hex();

        let mut builder = Orchestrator::builder(PipelineDefinition::from_yaml(pipeline).unwrap())
            .ledger(Ledger::new(temp.path()))
            .roster(approvers.roster())
            .tools(tools.registry())
            .signer(signer)
            .clock(clock.clone())
            .ledger_poll_interval(LEDGER_POLL)
            .sink(Arc::new(events.clone()));
        if let Some(timeout) = timeout {
            builder = builder.approval_timeout(timeout);
        }

        Self {
            orchestrator: Arc::new(builder.build().unwrap()),
            clock,
            approvers,
            events,
            signer_secret,
            pipeline: pipeline.to_string(),
            temp,
        }
    }

    /// A second orchestrator over the same ledger, as after a restart
    pub fn reopen(&self, tools: &Tools, keyring: KeyRing, same_signer: bool) -> Orchestrator {
        let signer = if same_signer {
            AttestationSigner::from_hex(&self.signer_secret).unwrap()
        } else {
            AttestationSigner::generate()
        };

        Orchestrator::builder(PipelineDefinition::from_yaml(&self.pipeline).unwrap())
            .ledger(Ledger::new(self.temp.path()))
            .roster(self.approvers.roster())
            .tools(tools.registry())
            .signer(signer)
            .keyring(keyring)
            .ledger_poll_interval(LEDGER_POLL)
            .build()
            .unwrap()
    }

    pub fn ledger(&self) -> Ledger {
        Ledger::new(self.temp.path())
    }

    pub async fn submit(&self) -> Uuid {
        self.orchestrator
            .submit_change("9f1c2e7", "dana")
            .await
            .unwrap()
            .change
            .id
    }

    /// A signed decision by the tier's default approver
    pub fn request(&self, change_id: Uuid, tier: Tier, decision: Decision) -> ApprovalRequest {
        let (id, _) = self.approvers.for_tier(tier);
        self.request_as(id, change_id, tier, decision)
    }

    pub fn request_as(
        &self,
        approver: &str,
        change_id: Uuid,
        tier: Tier,
        decision: Decision,
    ) -> ApprovalRequest {
        let signature = self
            .approvers
            .signer(approver)
            .sign(approval_message(change_id, tier, decision).as_bytes());
        ApprovalRequest::new(change_id, tier, decision, approver, signature)
    }

    pub async fn approve(&self, change_id: Uuid, tier: Tier) -> OrchestratorResult<ApprovalOutcome> {
        self.orchestrator
            .submit_approval(self.request(change_id, tier, Decision::Approve))
            .await
    }

    pub async fn approve_all(&self, change_id: Uuid) {
        for tier in Tier::ALL {
            self.approve(change_id, tier).await.unwrap();
        }
    }

    /// Mission-owner signature overriding a tier's rejection
    pub fn override_signature(&self, change_id: Uuid, tier: Tier) -> String {
        self.approvers
            .olivia
            .sign(override_message(change_id, tier).as_bytes())
    }

    /// Mission-owner signature accepting a stage's policy failure
    pub fn risk_signature(&self, change_id: Uuid, stage: &str) -> String {
        self.approvers
            .olivia
            .sign(risk_message(change_id, stage).as_bytes())
    }
}

/// Poll until `condition` holds, failing after two seconds
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
