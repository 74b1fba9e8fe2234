//! Core orchestration logic.
//!
//! This module contains:
//! - Pipeline: stage definitions, validation and DAG ordering
//! - Policy: pure evaluation of tool results against thresholds
//! - Approvals: the tiered approval gate and approver roster
//! - Chain / Ledger: signed, hash-chained attestations and their persistence
//! - Scheduler: concurrent stage execution with retry and cancellation
//! - Orchestrator: the per-Change state machine tying it together

pub mod approvals;
pub mod chain;
pub mod clock;
pub mod error;
pub mod ledger;
pub mod orchestrator;
pub mod pipeline;
pub mod policy;
pub mod scheduler;

// Re-export commonly used types
pub use approvals::{ApprovalOutcome, ApprovalRequest, ApproverEntry, ApproverRoster};
pub use chain::{
    verify_attestations, AttestationChain, AttestationSigner, ChainVerification, KeyRing,
    GENESIS_HASH,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{OrchestratorError, OrchestratorResult};
pub use ledger::{ChangeLock, Ledger, LedgerTail};
pub use orchestrator::{Orchestrator, OrchestratorBuilder, StatusReport};
pub use pipeline::{PipelineDefinition, RetryPolicy, StageDefinition, StageKind};
pub use policy::{evaluate, evaluate_stage, PolicyDecision, RiskAcceptance, Thresholds};
pub use scheduler::{ScheduleOutcome, StageScheduler};
