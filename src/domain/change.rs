//! A Change: one unit of code proposed for release.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One unit of code proposed for release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    /// Unique identifier
    pub id: Uuid,

    /// Source revision reference (commit sha, tag, ...)
    pub revision: String,

    /// Who submitted the change
    pub submitted_by: String,

    /// When the change entered the orchestrator
    pub submitted_at: DateTime<Utc>,

    /// Current lifecycle state
    pub state: ChangeState,
}

impl Change {
    /// Create a freshly submitted change
    pub fn new(revision: impl Into<String>, submitted_by: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            revision: revision.into(),
            submitted_by: submitted_by.into(),
            submitted_at: at,
            state: ChangeState::AwaitingApproval,
        }
    }
}

/// Lifecycle state of a change / pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    /// Suspended at the approval boundary
    AwaitingApproval,

    /// All tiers approved, scheduler not yet started
    Approved,

    /// Stage graph is running
    Executing,

    /// A stage failed; needs remediation, override or abort
    Blocked,

    /// Every stage passed
    Deployed,

    /// A tier rejected the change
    Rejected,

    /// Explicitly aborted by an operator
    Aborted,

    /// Approval wait exceeded the configured timeout
    Expired,
}

impl ChangeState {
    /// Terminal states admit no further transitions.
    ///
    /// `Rejected` is terminal unless an emergency override reopens it.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Deployed | Self::Rejected | Self::Aborted | Self::Expired
        )
    }

    /// Terminal with no way back; a rejection can still be overridden
    pub fn is_sealed(&self) -> bool {
        matches!(self, Self::Deployed | Self::Aborted | Self::Expired)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Executing => "executing",
            Self::Blocked => "blocked",
            Self::Deployed => "deployed",
            Self::Rejected => "rejected",
            Self::Aborted => "aborted",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for ChangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_change_awaits_approval() {
        let change = Change::new("abc123", "dev", Utc::now());
        assert_eq!(change.state, ChangeState::AwaitingApproval);
        assert!(!change.state.is_terminal());
    }

    #[test]
    fn test_terminal_states() {
        assert!(ChangeState::Deployed.is_terminal());
        assert!(ChangeState::Rejected.is_terminal());
        assert!(ChangeState::Expired.is_terminal());
        assert!(!ChangeState::Blocked.is_terminal());
        assert_eq!(ChangeState::AwaitingApproval.to_string(), "awaiting_approval");
    }
}
