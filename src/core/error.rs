//! Error taxonomy for orchestrator operations.
//!
//! Every variant that concerns a specific Change names the stage or tier
//! involved so a blocking condition can be acted on directly.

use thiserror::Error;
use uuid::Uuid;

use crate::domain::{ChangeState, Tier};

/// Result alias for orchestrator operations
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

/// Errors surfaced by core operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Out-of-order approval: {tier} requires an approved {missing} record first")]
    OutOfOrderApproval { tier: Tier, missing: Tier },

    #[error("Approver '{approver}' is not entitled to decide at tier {tier}")]
    UnauthorizedApprover { approver: String, tier: Tier },

    #[error("Tier {tier} already holds a decision by '{existing_approver}'")]
    DuplicateApproval {
        tier: Tier,
        existing_approver: String,
    },

    #[error("Gate not satisfied for change {change_id}: {detail}")]
    GateNotSatisfied { change_id: Uuid, detail: String },

    #[error("Stage '{stage}' execution failed after {attempts} attempt(s): {message}")]
    StageExecutionFailure {
        stage: String,
        attempts: u32,
        message: String,
    },

    #[error("Policy violation in stage '{stage}': {breaches}")]
    PolicyViolation { stage: String, breaches: String },

    #[error("Attestation chain for change {change_id} broken at index {index}: {reason}")]
    ChainVerificationFailure {
        change_id: Uuid,
        index: u64,
        reason: String,
    },

    #[error("Timed out waiting for {what} on change {change_id}")]
    TimeoutExpired { change_id: Uuid, what: String },

    #[error("Change {0} not found")]
    ChangeNotFound(Uuid),

    #[error("Change {change_id} is {state}; operation not permitted")]
    ChangeClosed { change_id: Uuid, state: ChangeState },

    #[error("Change {change_id} was rejected: {reason}")]
    ChangeRejected { change_id: Uuid, reason: String },

    #[error("Malformed signature from '{signer}': expected 128 hex characters")]
    MalformedSignature { signer: String },

    #[error("Signature from '{signer}' does not verify")]
    InvalidSignature { signer: String },

    #[error("Invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("Unknown stage '{0}'")]
    UnknownStage(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// Process exit code used by the CLI
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::OutOfOrderApproval { .. } => 10,
            Self::UnauthorizedApprover { .. } => 11,
            Self::DuplicateApproval { .. } => 12,
            Self::GateNotSatisfied { .. } => 20,
            Self::StageExecutionFailure { .. } => 21,
            Self::PolicyViolation { .. } => 22,
            Self::ChainVerificationFailure { .. } => 30,
            Self::TimeoutExpired { .. } => 40,
            Self::ChangeNotFound(_) => 50,
            Self::ChangeClosed { .. } | Self::ChangeRejected { .. } => 51,
            Self::MalformedSignature { .. } | Self::InvalidSignature { .. } => 13,
            Self::InvalidPipeline(_) | Self::UnknownStage(_) => 60,
            Self::InvalidRequest(_) => 2,
            Self::Internal(_) => 1,
        }
    }

    /// Only transient adapter failures are retried automatically
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StageExecutionFailure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_order_message_names_tiers() {
        let err = OrchestratorError::OutOfOrderApproval {
            tier: Tier::MissionOwner,
            missing: Tier::SecurityGatekeeper,
        };
        assert_eq!(
            err.to_string(),
            "Out-of-order approval: mission_owner requires an approved security_gatekeeper record first"
        );
        assert_eq!(err.exit_code(), 10);
    }

    #[test]
    fn test_only_execution_failures_retry() {
        let exec = OrchestratorError::StageExecutionFailure {
            stage: "sast".to_string(),
            attempts: 1,
            message: "connection reset".to_string(),
        };
        let policy = OrchestratorError::PolicyViolation {
            stage: "sca".to_string(),
            breaches: "critical findings 1 > 0".to_string(),
        };
        assert!(exec.is_retryable());
        assert!(!policy.is_retryable());
    }

    #[test]
    fn test_internal_errors_exit_one() {
        let err = OrchestratorError::from(anyhow::anyhow!("disk full"));
        assert_eq!(err.exit_code(), 1);
        assert_eq!(err.to_string(), "disk full");
    }
}
