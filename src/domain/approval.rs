//! Approval tiers, decisions and records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Review tier. Ordering is the required approval order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Peer,
    SecurityGatekeeper,
    MissionOwner,
}

impl Tier {
    /// All tiers in approval order
    pub const ALL: [Tier; 3] = [Tier::Peer, Tier::SecurityGatekeeper, Tier::MissionOwner];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Peer => "peer",
            Tier::SecurityGatekeeper => "security_gatekeeper",
            Tier::MissionOwner => "mission_owner",
        }
    }

    /// Tiers strictly below this one
    pub fn lower(&self) -> impl Iterator<Item = Tier> + '_ {
        Tier::ALL.into_iter().filter(move |t| t < self)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An approver's decision at one tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Approve,
    Reject,
    /// Approval with documented conditions (carried in the record's note)
    ConditionallyApprove,
}

impl Decision {
    /// Whether this decision unlocks the tier
    pub fn is_approval(&self) -> bool {
        matches!(self, Decision::Approve | Decision::ConditionallyApprove)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Decision::Approve => "approve",
            Decision::Reject => "reject",
            Decision::ConditionallyApprove => "conditionally_approve",
        }
    }
}

impl std::fmt::Display for Decision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded approval decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub change_id: Uuid,
    pub tier: Tier,
    pub approver: String,
    pub decision: Decision,
    pub recorded_at: DateTime<Utc>,

    /// Risk-acceptance note or approval conditions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,

    /// Approver's ed25519 signature over the approval message (hex)
    pub signature: String,
}

impl ApprovalRecord {
    /// Same tier, approver and decision
    pub fn matches(&self, tier: Tier, approver: &str, decision: Decision) -> bool {
        self.tier == tier && self.approver == approver && self.decision == decision
    }
}

/// Message an approver signs for a decision
pub fn approval_message(change_id: Uuid, tier: Tier, decision: Decision) -> String {
    format!("gatechain-approval:v1:{}:{}:{}", change_id, tier, decision)
}

/// Message a mission owner signs to override a tier's rejection
pub fn override_message(change_id: Uuid, tier: Tier) -> String {
    format!("gatechain-override:v1:{}:{}", change_id, tier.as_str())
}

/// Message a mission owner signs to accept a policy-failed stage
pub fn risk_message(change_id: Uuid, stage: &str) -> String {
    format!("gatechain-risk:v1:{}:{}", change_id, stage)
}

/// An emergency override reopening a rejected tier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideRecord {
    /// The tier whose rejection was overridden
    pub tier: Tier,

    /// Approver whose rejection was overridden
    pub original_approver: String,

    /// Why the rejection was overridden
    pub reason: String,

    /// Delegated authority invoking the override
    pub authority: String,

    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering() {
        assert!(Tier::Peer < Tier::SecurityGatekeeper);
        assert!(Tier::SecurityGatekeeper < Tier::MissionOwner);
        let lower: Vec<Tier> = Tier::MissionOwner.lower().collect();
        assert_eq!(lower, vec![Tier::Peer, Tier::SecurityGatekeeper]);
        assert_eq!(Tier::Peer.lower().count(), 0);
    }

    #[test]
    fn test_decision_unlocks() {
        assert!(Decision::Approve.is_approval());
        assert!(Decision::ConditionallyApprove.is_approval());
        assert!(!Decision::Reject.is_approval());
    }

    #[test]
    fn test_approval_message_format() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            approval_message(id, Tier::SecurityGatekeeper, Decision::Approve),
            "gatechain-approval:v1:550e8400-e29b-41d4-a716-446655440000:security_gatekeeper:approve"
        );
    }

    #[test]
    fn test_override_and_risk_messages_never_coincide() {
        let id = Uuid::new_v4();
        // A stage may share its name with a tier
        assert_ne!(override_message(id, Tier::Peer), risk_message(id, "peer"));
        assert!(risk_message(id, "sca").starts_with("gatechain-risk:v1:"));
        assert!(override_message(id, Tier::Peer).ends_with(":peer"));
    }

    #[test]
    fn test_tier_serialization() {
        let json = serde_json::to_string(&Tier::MissionOwner).unwrap();
        assert_eq!(json, "\"mission_owner\"");
    }
}
