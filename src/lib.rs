//! gatechain - Approval-gated pipeline orchestrator
//!
//! Moves a Change (a revision proposed for release) through a tiered
//! approval gate and a DAG of scan, compliance, build and deploy stages.
//!
//! # Architecture
//!
//! The system is built around a signed attestation chain:
//! - Every approval, stage result and state transition is an attestation
//! - Each attestation is hash-linked to its predecessor and ed25519 signed
//! - Current state is derived by replaying the chain
//! - Blocked runs resume from the first stage that did not pass
//!
//! # Modules
//!
//! - `adapters`: Tool interfaces (scanners, compliance, executors) and event sinks
//! - `core`: Gate, policy, scheduler, chain, ledger and the Orchestrator
//! - `domain`: Data structures (Change, ApprovalRecord, StageRun, Attestation)
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Submit a change
//! gatechain submit 3f2a9c1 --by dana
//!
//! # Approve it, tier by tier
//! gatechain approve <change-id> --tier peer --approver alice --key alice.key
//!
//! # Run the pipeline and inspect the result
//! gatechain run <change-id>
//! gatechain verify <change-id>
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;

// Re-export main types at crate root for convenience
pub use core::{Orchestrator, OrchestratorBuilder, OrchestratorError, OrchestratorResult};
pub use domain::{
    Attestation, Change, ChangeState, Decision, PipelineEvent, PipelineRun, StageStatus, Tier,
};
