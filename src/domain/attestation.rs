//! Attestations: immutable, signed, hash-chained audit records.
//!
//! Every state change of a Change is recorded as an attestation. The
//! chain for a Change is the only persisted state; everything else is
//! derived by replaying it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::approval::{ApprovalRecord, OverrideRecord};
use super::change::ChangeState;
use super::stage::{Breach, RiskException, StageRun};

/// Category of the thing being attested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubjectType {
    Submission,
    Approval,
    Stage,
    EmergencyOverride,
    Lifecycle,
    Denial,
}

impl SubjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubjectType::Submission => "submission",
            SubjectType::Approval => "approval",
            SubjectType::Stage => "stage",
            SubjectType::EmergencyOverride => "emergency-override",
            SubjectType::Lifecycle => "lifecycle",
            SubjectType::Denial => "denial",
        }
    }
}

/// What an attestation is about: a stage name, a tier, or the change itself
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub kind: SubjectType,
    pub name: String,
}

impl Subject {
    pub fn new(kind: SubjectType, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.name)
    }
}

/// Decision summary carried by an attestation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AttestationPayload {
    ChangeSubmitted {
        revision: String,
        submitted_by: String,
        pipeline: String,
        submitted_at: DateTime<Utc>,
    },

    ApprovalRecorded {
        record: ApprovalRecord,
    },

    StageCompleted {
        run: StageRun,
    },

    /// Emergency override of a tier rejection
    RejectionOverridden {
        record: OverrideRecord,
        signature: String,
    },

    /// Mission-owner risk acceptance of a policy-failed stage
    RiskAccepted {
        stage: String,
        breaches: Vec<Breach>,
        exception: RiskException,
        signature: String,
    },

    Lifecycle {
        state: ChangeState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },

    /// Operator abort of an executing run, honoured by whichever process
    /// is executing it
    AbortRequested {
        reason: String,
    },

    /// A refused request. Leaves the Change state untouched.
    RequestDenied {
        /// e.g. `approval:peer`, `run`, `risk_acceptance:sca`
        operation: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        actor: Option<String>,
        reason: String,
        exit_code: i32,
    },
}

impl AttestationPayload {
    /// The subject this payload attests to
    pub fn subject(&self) -> Subject {
        match self {
            AttestationPayload::ChangeSubmitted { revision, .. } => {
                Subject::new(SubjectType::Submission, revision.clone())
            }
            AttestationPayload::ApprovalRecorded { record } => {
                Subject::new(SubjectType::Approval, record.tier.as_str())
            }
            AttestationPayload::StageCompleted { run } => {
                Subject::new(SubjectType::Stage, run.stage.clone())
            }
            AttestationPayload::RejectionOverridden { record, .. } => {
                Subject::new(SubjectType::EmergencyOverride, record.tier.as_str())
            }
            AttestationPayload::RiskAccepted { stage, .. } => {
                Subject::new(SubjectType::EmergencyOverride, stage.clone())
            }
            AttestationPayload::Lifecycle { state, .. } => {
                Subject::new(SubjectType::Lifecycle, state.as_str())
            }
            AttestationPayload::AbortRequested { .. } => {
                Subject::new(SubjectType::Lifecycle, "abort_requested")
            }
            AttestationPayload::RequestDenied { operation, .. } => {
                Subject::new(SubjectType::Denial, operation.clone())
            }
        }
    }
}

/// One link of a Change's attestation chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    /// Position in the chain (append order)
    pub index: u64,

    pub change_id: Uuid,

    pub subject: Subject,

    pub payload: AttestationPayload,

    /// Key id of the signer (see `core::chain::key_id`)
    pub signer_key_id: String,

    pub recorded_at: DateTime<Utc>,

    /// Hash of the previous link, or the genesis seed
    pub previous_hash: String,

    /// SHA-256 over previous hash and canonical body (hex)
    pub hash: String,

    /// ed25519 signature over `hash` (hex)
    pub signature: String,
}

impl Attestation {
    /// Short hash for display
    pub fn short_hash(&self) -> &str {
        &self.hash[..self.hash.len().min(12)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::approval::{Decision, Tier};

    #[test]
    fn test_payload_subject() {
        let payload = AttestationPayload::ApprovalRecorded {
            record: ApprovalRecord {
                change_id: Uuid::new_v4(),
                tier: Tier::Peer,
                approver: "alice".to_string(),
                decision: Decision::Approve,
                recorded_at: Utc::now(),
                note: None,
                signature: String::new(),
            },
        };
        let subject = payload.subject();
        assert_eq!(subject.kind, SubjectType::Approval);
        assert_eq!(subject.to_string(), "approval:peer");
    }

    #[test]
    fn test_lifecycle_payload_json() {
        let payload = AttestationPayload::Lifecycle {
            state: ChangeState::Blocked,
            reason: Some("stage 'sca' failed".to_string()),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "lifecycle");
        assert_eq!(json["state"], "blocked");

        let parsed: AttestationPayload = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, payload);
    }

    #[test]
    fn test_denial_subject() {
        let payload = AttestationPayload::RequestDenied {
            operation: "approval:mission_owner".to_string(),
            actor: Some("olivia".to_string()),
            reason: "Out-of-order approval".to_string(),
            exit_code: 10,
        };
        assert_eq!(payload.subject().to_string(), "denial:approval:mission_owner");
    }

    #[test]
    fn test_override_subject_type() {
        assert_eq!(SubjectType::EmergencyOverride.as_str(), "emergency-override");
    }
}
