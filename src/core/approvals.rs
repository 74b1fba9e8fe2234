//! Approval Gate Engine.
//!
//! Validates approval decisions against the approver roster and the
//! Change's recorded approvals. Checks are pure over a `PipelineRun`; the
//! orchestrator appends the resulting attestation.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use anyhow::{Context, Result};
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::domain::{
    approval_message, override_message, ApprovalRecord, ChangeState, Decision, PipelineRun, Tier,
};

use super::chain::{parse_signature, parse_verifying_key, verify_hex};
use super::error::{OrchestratorError, OrchestratorResult};

/// One roster entry as written in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApproverEntry {
    pub id: String,

    /// Tiers this approver may decide at
    pub tiers: Vec<Tier>,

    /// Hex ed25519 public key; when present, signatures are verified
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RosterFile {
    #[serde(default)]
    approvers: Vec<ApproverEntry>,
}

#[derive(Debug, Clone)]
struct Approver {
    tiers: BTreeSet<Tier>,
    public_key: Option<VerifyingKey>,
}

/// Approver identities and their tier entitlements
#[derive(Debug, Clone, Default)]
pub struct ApproverRoster {
    approvers: HashMap<String, Approver>,
}

impl ApproverRoster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a roster from YAML (`approvers: [{id, tiers, public_key?}]`)
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: RosterFile = serde_yaml::from_str(yaml).context("Failed to parse approver roster")?;
        let mut roster = Self::new();
        for entry in file.approvers {
            let key = entry
                .public_key
                .as_deref()
                .map(parse_verifying_key)
                .transpose()
                .with_context(|| format!("Invalid public key for approver '{}'", entry.id))?;
            roster.insert(entry.id, entry.tiers, key);
        }
        Ok(roster)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read approver roster: {}", path.display()))?;
        Self::from_yaml(&content)
    }

    /// Add or replace an approver
    pub fn insert(
        &mut self,
        id: impl Into<String>,
        tiers: impl IntoIterator<Item = Tier>,
        public_key: Option<VerifyingKey>,
    ) -> &mut Self {
        self.approvers.insert(
            id.into(),
            Approver {
                tiers: tiers.into_iter().collect(),
                public_key,
            },
        );
        self
    }

    pub fn is_entitled(&self, approver: &str, tier: Tier) -> bool {
        self.approvers
            .get(approver)
            .map_or(false, |a| a.tiers.contains(&tier))
    }

    pub fn public_key(&self, approver: &str) -> Option<&VerifyingKey> {
        self.approvers.get(approver).and_then(|a| a.public_key.as_ref())
    }

    pub fn len(&self) -> usize {
        self.approvers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.approvers.is_empty()
    }

    /// Require an entitlement for `tier`
    pub fn require_entitled(&self, approver: &str, tier: Tier) -> OrchestratorResult<()> {
        if self.is_entitled(approver, tier) {
            Ok(())
        } else {
            Err(OrchestratorError::UnauthorizedApprover {
                approver: approver.to_string(),
                tier,
            })
        }
    }

    /// Check the signature format, and verify it if the approver has a key on file
    pub fn check_signature(
        &self,
        approver: &str,
        message: &str,
        signature_hex: &str,
    ) -> OrchestratorResult<()> {
        if parse_signature(signature_hex).is_none() {
            return Err(OrchestratorError::MalformedSignature {
                signer: approver.to_string(),
            });
        }

        match self.public_key(approver) {
            Some(key) => {
                if !verify_hex(key, message.as_bytes(), signature_hex) {
                    return Err(OrchestratorError::InvalidSignature {
                        signer: approver.to_string(),
                    });
                }
            }
            None => warn!(%approver, "No public key on roster; signature not verified"),
        }

        Ok(())
    }
}

/// A decision submitted by an approver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub change_id: Uuid,
    pub tier: Tier,
    pub decision: Decision,
    pub approver: String,

    /// Hex ed25519 signature over `approval_message(change_id, tier, decision)`
    pub signature: String,

    /// Conditions (required for a conditional approval) or rejection reason
    #[serde(default)]
    pub note: Option<String>,
}

impl ApprovalRequest {
    pub fn new(
        change_id: Uuid,
        tier: Tier,
        decision: Decision,
        approver: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        Self {
            change_id,
            tier,
            decision,
            approver: approver.into(),
            signature: signature.into(),
            note: None,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn message(&self) -> String {
        approval_message(self.change_id, self.tier, self.decision)
    }
}

/// Result of a successful approval submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    /// A new record was attested
    Recorded(ApprovalRecord),

    /// An identical record already exists; nothing was appended
    AlreadyRecorded(ApprovalRecord),
}

impl ApprovalOutcome {
    pub fn record(&self) -> &ApprovalRecord {
        match self {
            Self::Recorded(r) | Self::AlreadyRecorded(r) => r,
        }
    }

    pub fn is_new(&self) -> bool {
        matches!(self, Self::Recorded(_))
    }
}

/// What the gate decided about a request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateCheck {
    Accept,
    Duplicate(ApprovalRecord),
}

/// Validate an approval against the roster and the run's recorded approvals
pub fn check_approval(
    run: &PipelineRun,
    roster: &ApproverRoster,
    request: &ApprovalRequest,
) -> OrchestratorResult<GateCheck> {
    roster.require_entitled(&request.approver, request.tier)?;
    roster.check_signature(&request.approver, &request.message(), &request.signature)?;

    if let Some(existing) = run.tier_record(request.tier) {
        if existing.matches(request.tier, &request.approver, request.decision) {
            return Ok(GateCheck::Duplicate(existing.clone()));
        }
    }

    match run.change.state {
        ChangeState::AwaitingApproval => {}
        ChangeState::Rejected => {
            return Err(OrchestratorError::ChangeRejected {
                change_id: run.change.id,
                reason: run
                    .block_reason
                    .clone()
                    .unwrap_or_else(|| "rejected".to_string()),
            })
        }
        state => {
            return Err(OrchestratorError::ChangeClosed {
                change_id: run.change.id,
                state,
            })
        }
    }

    if let Some(missing) = request.tier.lower().find(|t| !run.tier_satisfied(*t)) {
        return Err(OrchestratorError::OutOfOrderApproval {
            tier: request.tier,
            missing,
        });
    }

    if let Some(existing) = run.tier_record(request.tier) {
        return Err(OrchestratorError::DuplicateApproval {
            tier: request.tier,
            existing_approver: existing.approver.clone(),
        });
    }

    if request.decision == Decision::ConditionallyApprove
        && request.note.as_deref().map_or(true, |n| n.trim().is_empty())
    {
        return Err(OrchestratorError::InvalidRequest(
            "a conditional approval must state its conditions in a note".to_string(),
        ));
    }

    Ok(GateCheck::Accept)
}

/// The rejection an emergency override would reopen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideTarget {
    pub tier: Tier,
    pub original_approver: String,
}

/// Validate an emergency override of a rejected Change
pub fn check_override(
    run: &PipelineRun,
    roster: &ApproverRoster,
    authority: &str,
    signature: &str,
) -> OrchestratorResult<OverrideTarget> {
    roster.require_entitled(authority, Tier::MissionOwner)?;

    let Some(rejection) = run.pending_rejection() else {
        return Err(OrchestratorError::ChangeClosed {
            change_id: run.change.id,
            state: run.change.state,
        });
    };

    roster.check_signature(
        authority,
        &override_message(run.change.id, rejection.tier),
        signature,
    )?;

    Ok(OverrideTarget {
        tier: rejection.tier,
        original_approver: rejection.approver.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::chain::AttestationSigner;
    use crate::domain::{Attestation, AttestationPayload, Change};
    use chrono::Utc;

    const ROSTER: &str = r#"
approvers:
  - id: alice
    tiers: [peer]
  - id: grace
    tiers: [security_gatekeeper]
  - id: olivia
    tiers: [mission_owner]
"#;

    fn sig() -> String {
        "ab".repeat(64)
    }

    fn run() -> PipelineRun {
        PipelineRun::new(Change::new("abc123", "dev", Utc::now()), "release")
    }

    fn record(run: &mut PipelineRun, tier: Tier, approver: &str, decision: Decision) {
        let record = ApprovalRecord {
            change_id: run.change.id,
            tier,
            approver: approver.to_string(),
            decision,
            recorded_at: Utc::now(),
            note: None,
            signature: sig(),
        };
        let payload = AttestationPayload::ApprovalRecorded { record };
        run.apply(&Attestation {
            index: run.chain_length,
            change_id: run.change.id,
            subject: payload.subject(),
            payload,
            signer_key_id: String::new(),
            recorded_at: Utc::now(),
            previous_hash: String::new(),
            hash: String::new(),
            signature: String::new(),
        });
    }

    #[test]
    fn test_roster_entitlements() {
        let roster = ApproverRoster::from_yaml(ROSTER).unwrap();
        assert_eq!(roster.len(), 3);
        assert!(roster.is_entitled("alice", Tier::Peer));
        assert!(!roster.is_entitled("alice", Tier::MissionOwner));
        assert!(!roster.is_entitled("mallory", Tier::Peer));
    }

    #[test]
    fn test_out_of_order_names_missing_tier() {
        let roster = ApproverRoster::from_yaml(ROSTER).unwrap();
        let run = run();
        let request =
            ApprovalRequest::new(run.change.id, Tier::MissionOwner, Decision::Approve, "olivia", sig());

        let err = check_approval(&run, &roster, &request).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::OutOfOrderApproval {
                tier: Tier::MissionOwner,
                missing: Tier::Peer
            }
        ));
    }

    #[test]
    fn test_unentitled_approver_rejected() {
        let roster = ApproverRoster::from_yaml(ROSTER).unwrap();
        let run = run();
        let request = ApprovalRequest::new(run.change.id, Tier::Peer, Decision::Approve, "olivia", sig());
        assert!(matches!(
            check_approval(&run, &roster, &request),
            Err(OrchestratorError::UnauthorizedApprover { .. })
        ));
    }

    #[test]
    fn test_malformed_signature_rejected() {
        let roster = ApproverRoster::from_yaml(ROSTER).unwrap();
        let run = run();
        let request = ApprovalRequest::new(run.change.id, Tier::Peer, Decision::Approve, "alice", "nope");
        assert!(matches!(
            check_approval(&run, &roster, &request),
            Err(OrchestratorError::MalformedSignature { .. })
        ));
    }

    #[test]
    fn test_signature_verified_when_key_on_file() {
        let signer = AttestationSigner::generate();
        let mut roster = ApproverRoster::new();
        roster.insert("alice", [Tier::Peer], Some(signer.verifying_key()));

        let run = run();
        let forged = ApprovalRequest::new(run.change.id, Tier::Peer, Decision::Approve, "alice", sig());
        assert!(matches!(
            check_approval(&run, &roster, &forged),
            Err(OrchestratorError::InvalidSignature { .. })
        ));

        let message = approval_message(run.change.id, Tier::Peer, Decision::Approve);
        let signed = ApprovalRequest::new(
            run.change.id,
            Tier::Peer,
            Decision::Approve,
            "alice",
            signer.sign(message.as_bytes()),
        );
        assert_eq!(check_approval(&run, &roster, &signed).unwrap(), GateCheck::Accept);
    }

    #[test]
    fn test_identical_resubmission_is_duplicate_not_error() {
        let roster = ApproverRoster::from_yaml(ROSTER).unwrap();
        let mut run = run();
        record(&mut run, Tier::Peer, "alice", Decision::Approve);

        let same = ApprovalRequest::new(run.change.id, Tier::Peer, Decision::Approve, "alice", sig());
        assert!(matches!(
            check_approval(&run, &roster, &same).unwrap(),
            GateCheck::Duplicate(_)
        ));

        let changed = ApprovalRequest::new(run.change.id, Tier::Peer, Decision::Reject, "alice", sig());
        assert!(matches!(
            check_approval(&run, &roster, &changed),
            Err(OrchestratorError::DuplicateApproval { .. })
        ));
    }

    #[test]
    fn test_conditional_approval_requires_note() {
        let roster = ApproverRoster::from_yaml(ROSTER).unwrap();
        let run = run();
        let bare = ApprovalRequest::new(
            run.change.id,
            Tier::Peer,
            Decision::ConditionallyApprove,
            "alice",
            sig(),
        );
        assert!(matches!(
            check_approval(&run, &roster, &bare),
            Err(OrchestratorError::InvalidRequest(_))
        ));
        assert!(check_approval(&run, &roster, &bare.with_note("pin the base image")).is_ok());
    }

    #[test]
    fn test_rejected_change_refuses_further_approvals() {
        let roster = ApproverRoster::from_yaml(ROSTER).unwrap();
        let mut run = run();
        record(&mut run, Tier::Peer, "alice", Decision::Reject);

        let next = ApprovalRequest::new(
            run.change.id,
            Tier::SecurityGatekeeper,
            Decision::Approve,
            "grace",
            sig(),
        );
        assert!(matches!(
            check_approval(&run, &roster, &next),
            Err(OrchestratorError::ChangeRejected { .. })
        ));
    }

    #[test]
    fn test_override_targets_rejected_tier() {
        let roster = ApproverRoster::from_yaml(ROSTER).unwrap();
        let mut run = run();
        record(&mut run, Tier::Peer, "alice", Decision::Approve);
        record(&mut run, Tier::SecurityGatekeeper, "grace", Decision::Reject);

        assert!(matches!(
            check_override(&run, &roster, "alice", &sig()),
            Err(OrchestratorError::UnauthorizedApprover { .. })
        ));

        let target = check_override(&run, &roster, "olivia", &sig()).unwrap();
        assert_eq!(target.tier, Tier::SecurityGatekeeper);
        assert_eq!(target.original_approver, "grace");
    }
}
