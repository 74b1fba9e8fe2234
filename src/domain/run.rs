//! PipelineRun state and reconstruction from attestations.
//!
//! A PipelineRun is the aggregate root for one Change: its approvals,
//! stage runs and chain head. It is never persisted directly; it is
//! rebuilt by replaying the Change's attestation chain.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::approval::{ApprovalRecord, Decision, OverrideRecord, Tier};
use super::attestation::{Attestation, AttestationPayload};
use super::change::{Change, ChangeState};
use super::stage::{StageRun, StageStatus};

/// Full lifecycle record of one Change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub change: Change,

    /// Name of the pipeline definition the change runs through
    pub pipeline: String,

    /// Approval records in recorded order
    pub approvals: Vec<ApprovalRecord>,

    /// Emergency overrides of rejections
    pub overrides: Vec<OverrideRecord>,

    /// Latest run of each dispatched stage
    pub stages: BTreeMap<String, StageRun>,

    /// Hash of the newest attestation
    pub chain_head: Option<String>,

    /// Number of attestations applied
    pub chain_length: u64,

    /// Why the run is blocked / rejected / aborted / expired
    pub block_reason: Option<String>,

    /// When a terminal state was reached
    pub completed_at: Option<DateTime<Utc>>,

    /// Reason of an abort requested while executing, until the run settles
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_requested: Option<String>,
}

impl PipelineRun {
    /// Create the run for a newly submitted change
    pub fn new(change: Change, pipeline: impl Into<String>) -> Self {
        Self {
            change,
            pipeline: pipeline.into(),
            approvals: Vec::new(),
            overrides: Vec::new(),
            stages: BTreeMap::new(),
            chain_head: None,
            chain_length: 0,
            block_reason: None,
            completed_at: None,
            abort_requested: None,
        }
    }

    /// Reconstruct run state from a chain. The first link must be the submission.
    pub fn from_attestations(attestations: &[Attestation]) -> Option<Self> {
        let first = attestations.first()?;

        let change = match &first.payload {
            AttestationPayload::ChangeSubmitted {
                revision,
                submitted_by,
                submitted_at,
                ..
            } => Change {
                id: first.change_id,
                revision: revision.clone(),
                submitted_by: submitted_by.clone(),
                submitted_at: *submitted_at,
                state: ChangeState::AwaitingApproval,
            },
            _ => return None,
        };

        let mut run = Self::new(change, String::new());
        for attestation in attestations {
            run.apply(attestation);
        }

        Some(run)
    }

    /// Apply a single attestation to update run state
    pub fn apply(&mut self, attestation: &Attestation) {
        match &attestation.payload {
            AttestationPayload::ChangeSubmitted { pipeline, .. } => {
                self.pipeline = pipeline.clone();
                self.change.state = ChangeState::AwaitingApproval;
            }
            AttestationPayload::ApprovalRecorded { record } => {
                self.approvals.push(record.clone());
                if record.decision == Decision::Reject {
                    self.change.state = ChangeState::Rejected;
                    self.block_reason = Some(format!(
                        "{} rejected by {}{}",
                        record.tier,
                        record.approver,
                        record
                            .note
                            .as_ref()
                            .map(|n| format!(": {}", n))
                            .unwrap_or_default()
                    ));
                    self.completed_at = Some(attestation.recorded_at);
                } else if self.gate_satisfied() {
                    self.change.state = ChangeState::Approved;
                }
            }
            AttestationPayload::StageCompleted { run } => {
                let mut run = run.clone();
                run.attestation_hash = Some(attestation.hash.clone());
                self.stages.insert(run.stage.clone(), run);
            }
            AttestationPayload::RejectionOverridden { record, .. } => {
                self.overrides.push(record.clone());
                self.block_reason = None;
                self.completed_at = None;
                self.change.state = if self.gate_satisfied() {
                    ChangeState::Approved
                } else {
                    ChangeState::AwaitingApproval
                };
            }
            AttestationPayload::RiskAccepted {
                stage, exception, ..
            } => {
                if let Some(run) = self.stages.get_mut(stage) {
                    run.status = StageStatus::PassedWithException;
                    run.exception = Some(exception.clone());
                }
            }
            AttestationPayload::Lifecycle { state, reason } => {
                self.change.state = *state;
                self.abort_requested = None;
                match state {
                    ChangeState::Executing | ChangeState::Approved => {
                        self.block_reason = None;
                    }
                    _ => {
                        if reason.is_some() {
                            self.block_reason = reason.clone();
                        }
                    }
                }
                if state.is_terminal() {
                    self.completed_at = Some(attestation.recorded_at);
                }
            }
            AttestationPayload::AbortRequested { reason } => {
                if self.change.state == ChangeState::Executing {
                    self.abort_requested = Some(reason.clone());
                }
            }
            AttestationPayload::RequestDenied { .. } => {}
        }

        self.chain_head = Some(attestation.hash.clone());
        self.chain_length = attestation.index + 1;
    }

    /// The decision recorded for a tier, if any
    pub fn tier_record(&self, tier: Tier) -> Option<&ApprovalRecord> {
        self.approvals.iter().rev().find(|r| r.tier == tier)
    }

    /// Whether a tier's rejection was overridden
    pub fn is_overridden(&self, tier: Tier) -> bool {
        self.overrides.iter().any(|o| o.tier == tier)
    }

    /// A tier is satisfied by an approval or by an overridden rejection
    pub fn tier_satisfied(&self, tier: Tier) -> bool {
        match self.tier_record(tier) {
            Some(record) if record.decision.is_approval() => true,
            Some(_) => self.is_overridden(tier),
            None => false,
        }
    }

    /// A rejection that has not been overridden
    pub fn pending_rejection(&self) -> Option<&ApprovalRecord> {
        self.approvals
            .iter()
            .find(|r| r.decision == Decision::Reject && !self.is_overridden(r.tier))
    }

    /// All tiers satisfied, in order
    pub fn gate_satisfied(&self) -> bool {
        Tier::ALL.iter().all(|t| self.tier_satisfied(*t))
    }

    /// True only when every tier holds an approval and nothing is rejected
    pub fn is_ready_for_execution(&self) -> bool {
        self.gate_satisfied() && self.pending_rejection().is_none()
    }

    /// Effective status of a stage in this run
    pub fn stage_status(&self, stage: &str) -> StageStatus {
        match self.stages.get(stage) {
            Some(run) => run.status,
            None if matches!(
                self.change.state,
                ChangeState::Blocked | ChangeState::Aborted | ChangeState::Deployed
            ) =>
            {
                StageStatus::Skipped
            }
            None => StageStatus::Pending,
        }
    }

    /// Stages currently holding the run in `blocked`
    pub fn failed_stages(&self) -> Vec<&StageRun> {
        self.stages
            .values()
            .filter(|s| matches!(s.status, StageStatus::Failed | StageStatus::Blocked))
            .collect()
    }

    pub fn is_terminal(&self) -> bool {
        self.change.state.is_terminal()
    }
}
