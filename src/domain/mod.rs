//! Domain types for the gatechain orchestrator.
//!
//! This module contains the core data structures:
//! - Change: a unit of code proposed for release
//! - Approval: tiers, decisions and records
//! - Stage: stage runs and normalized tool results
//! - Attestation: signed, chained audit records
//! - Run: the PipelineRun aggregate rebuilt from attestations
//! - Events: the read-only notification feed

pub mod approval;
pub mod attestation;
pub mod change;
pub mod events;
pub mod run;
pub mod stage;

// Re-export commonly used types
pub use approval::{
    approval_message, override_message, risk_message, ApprovalRecord, Decision, OverrideRecord, Tier,
};
pub use attestation::{Attestation, AttestationPayload, Subject, SubjectType};
pub use change::{Change, ChangeState};
pub use events::{EventType, PipelineEvent};
pub use run::PipelineRun;
pub use stage::{
    Breach, ComplianceReport, ExecutionReport, FailureKind, RiskException, ScanReport, Severity,
    StageRun, StageStatus, ToolResult,
};
