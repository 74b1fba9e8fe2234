//! Stage execution records and normalized tool results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of one stage execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Not yet dispatched
    Pending,

    /// Dispatched to its adapter
    Running,

    /// Result met every threshold
    Passed,

    /// Failed policy, downgraded by a recorded risk acceptance
    PassedWithException,

    /// Policy breach or exhausted retries
    Failed,

    /// Result could not be evaluated against the stage policy
    Blocked,

    /// Cancelled at a checkpoint
    Aborted,

    /// Never dispatched because the run halted
    Skipped,
}

impl StageStatus {
    /// Dependents may start once a predecessor is in one of these
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Passed | Self::PassedWithException)
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Passed => "passed",
            Self::PassedWithException => "passed_with_exception",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::Aborted => "aborted",
            Self::Skipped => "skipped",
        }
    }
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a stage failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Threshold breach; never retried automatically
    PolicyViolation,

    /// Adapter error after the retry budget was spent
    Execution,

    /// Adapter exceeded the stage timeout on every attempt
    Timeout,
}

/// Finding severity, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
    Info,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Critical,
        Severity::High,
        Severity::Medium,
        Severity::Low,
        Severity::Info,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "critical",
            Severity::High => "high",
            Severity::Medium => "medium",
            Severity::Low => "low",
            Severity::Info => "info",
        }
    }
}

/// Normalized scanner output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanReport {
    #[serde(default)]
    pub critical: u32,
    #[serde(default)]
    pub high: u32,
    #[serde(default)]
    pub medium: u32,
    #[serde(default)]
    pub low: u32,
    #[serde(default)]
    pub info: u32,

    /// Where the full tool report lives
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_ref: Option<String>,
}

impl ScanReport {
    pub fn count(&self, severity: Severity) -> u32 {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
            Severity::Info => self.info,
        }
    }
}

/// Normalized compliance checker output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceReport {
    pub compliant: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results_ref: Option<String>,
}

/// Normalized build/deploy executor output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub success: bool,

    /// Artifact or environment reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

/// Raw result of a stage, as returned by its adapter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolResult {
    Scan(ScanReport),
    Compliance(ComplianceReport),
    Build(ExecutionReport),
    Deploy(ExecutionReport),
}

impl ToolResult {
    /// Reference to the full result payload, if the tool gave one
    pub fn reference(&self) -> Option<&str> {
        match self {
            ToolResult::Scan(r) => r.results_ref.as_deref(),
            ToolResult::Compliance(r) => r.results_ref.as_deref(),
            ToolResult::Build(r) | ToolResult::Deploy(r) => r.reference.as_deref(),
        }
    }
}

/// One breached policy threshold
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Breach {
    Findings {
        severity: Severity,
        actual: u32,
        limit: u32,
    },
    ExecutionFailed {
        category: String,
    },
    NonCompliant,
}

impl std::fmt::Display for Breach {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Breach::Findings {
                severity,
                actual,
                limit,
            } => write!(f, "{} findings {} > {}", severity.as_str(), actual, limit),
            Breach::ExecutionFailed { category } => write!(f, "{} reported failure", category),
            Breach::NonCompliant => f.write_str("compliance check reported non-compliant"),
        }
    }
}

/// A recorded mission-owner risk acceptance on a failed stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskException {
    pub accepted_by: String,
    pub note: String,

    /// Hash of the attestation that recorded the original failure
    pub original_attestation: String,

    pub recorded_at: DateTime<Utc>,
}

/// One execution of a StageDefinition for a Change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRun {
    pub stage: String,
    pub status: StageStatus,

    /// Attempts made (1 = no retries)
    #[serde(default)]
    pub attempts: u32,

    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ToolResult>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub breaches: Vec<Breach>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureKind>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Hash of the attestation recording this run's outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attestation_hash: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<RiskException>,
}

impl StageRun {
    pub fn pending(stage: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            status: StageStatus::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            result: None,
            breaches: Vec::new(),
            failure: None,
            error: None,
            attestation_hash: None,
            exception: None,
        }
    }

    /// Breaches joined for display
    pub fn breach_summary(&self) -> String {
        self.breaches
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breach_display() {
        let breach = Breach::Findings {
            severity: Severity::Critical,
            actual: 1,
            limit: 0,
        };
        assert_eq!(breach.to_string(), "critical findings 1 > 0");

        let breach = Breach::ExecutionFailed {
            category: "deploy".to_string(),
        };
        assert_eq!(breach.to_string(), "deploy reported failure");
    }

    #[test]
    fn test_tool_result_tagged_json() {
        let json = r#"{"kind":"scan","critical":1,"high":2,"results_ref":"s3://r/1"}"#;
        let result: ToolResult = serde_json::from_str(json).unwrap();
        match &result {
            ToolResult::Scan(report) => {
                assert_eq!(report.critical, 1);
                assert_eq!(report.high, 2);
                assert_eq!(report.medium, 0);
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(result.reference(), Some("s3://r/1"));
    }

    #[test]
    fn test_stage_status_success() {
        assert!(StageStatus::Passed.is_success());
        assert!(StageStatus::PassedWithException.is_success());
        assert!(!StageStatus::Failed.is_success());
        assert!(!StageStatus::Running.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
    }
}
