//! Read-only state-transition feed for notification and dashboard sinks.
//!
//! Events are derived from attestations after they are appended. They are
//! never a source of truth and sinks must not block on delivery.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::attestation::{Attestation, AttestationPayload};

/// A single state transition published to sinks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineEvent {
    /// Unique identifier for this event
    pub id: Uuid,

    /// When the underlying attestation was recorded
    pub timestamp: DateTime<Utc>,

    /// The change this event belongs to
    pub change_id: Uuid,

    /// Type of event
    pub event_type: EventType,

    /// Stage name or tier, when applicable
    pub subject: Option<String>,

    /// Human-readable summary (no signatures or key material)
    pub summary: String,

    /// Hash of the attestation that produced this event
    pub attestation_hash: String,
}

/// Types of events published to sinks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ChangeSubmitted,
    ApprovalRecorded,
    StageFinished,
    OverrideRecorded,
    RunStateChanged,
    AbortRequested,
    RequestDenied,
}

impl PipelineEvent {
    /// Derive the feed event for an appended attestation
    pub fn from_attestation(attestation: &Attestation) -> Self {
        let (event_type, subject, summary) = match &attestation.payload {
            AttestationPayload::ChangeSubmitted {
                revision,
                submitted_by,
                ..
            } => (
                EventType::ChangeSubmitted,
                None,
                format!("Change {} submitted by {}", revision, submitted_by),
            ),
            AttestationPayload::ApprovalRecorded { record } => (
                EventType::ApprovalRecorded,
                Some(record.tier.to_string()),
                format!("{} {} by {}", record.tier, record.decision, record.approver),
            ),
            AttestationPayload::StageCompleted { run } => {
                let mut summary = format!("Stage '{}' {}", run.stage, run.status);
                if !run.breaches.is_empty() {
                    summary.push_str(&format!(" ({})", run.breach_summary()));
                }
                (EventType::StageFinished, Some(run.stage.clone()), summary)
            }
            AttestationPayload::RejectionOverridden { record, .. } => (
                EventType::OverrideRecorded,
                Some(record.tier.to_string()),
                format!(
                    "Emergency override of {} rejection by {}",
                    record.tier, record.authority
                ),
            ),
            AttestationPayload::RiskAccepted {
                stage, exception, ..
            } => (
                EventType::OverrideRecorded,
                Some(stage.clone()),
                format!(
                    "Risk accepted for stage '{}' by {}",
                    stage, exception.accepted_by
                ),
            ),
            AttestationPayload::Lifecycle { state, reason } => (
                EventType::RunStateChanged,
                None,
                match reason {
                    Some(reason) => format!("Run {}: {}", state, reason),
                    None => format!("Run {}", state),
                },
            ),
            AttestationPayload::AbortRequested { reason } => (
                EventType::AbortRequested,
                None,
                format!("Abort requested: {}", reason),
            ),
            AttestationPayload::RequestDenied {
                operation,
                actor,
                reason,
                ..
            } => (
                EventType::RequestDenied,
                Some(operation.clone()),
                match actor {
                    Some(actor) => format!("Denied {} by {}: {}", operation, actor, reason),
                    None => format!("Denied {}: {}", operation, reason),
                },
            ),
        };

        Self {
            id: Uuid::new_v4(),
            timestamp: attestation.recorded_at,
            change_id: attestation.change_id,
            event_type,
            subject,
            summary,
            attestation_hash: attestation.hash.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::change::ChangeState;

    #[test]
    fn test_lifecycle_event_summary() {
        let payload = AttestationPayload::Lifecycle {
            state: ChangeState::Blocked,
            reason: Some("stage 'sca' failed".to_string()),
        };
        let attestation = Attestation {
            index: 3,
            change_id: Uuid::new_v4(),
            subject: payload.subject(),
            payload,
            signer_key_id: "k".to_string(),
            recorded_at: Utc::now(),
            previous_hash: String::new(),
            hash: "abc".to_string(),
            signature: String::new(),
        };

        let event = PipelineEvent::from_attestation(&attestation);
        assert_eq!(event.event_type, EventType::RunStateChanged);
        assert_eq!(event.summary, "Run blocked: stage 'sca' failed");
        assert_eq!(event.attestation_hash, "abc");
    }
}
