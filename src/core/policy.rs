//! Policy evaluation of stage results.
//!
//! `evaluate` is a pure function of thresholds and a normalized tool
//! result. Every breached threshold is reported, not just the first.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{Breach, Severity, ToolResult};

use super::pipeline::{StageDefinition, StageKind};

/// Pass/fail thresholds for one stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thresholds {
    /// Maximum allowed critical findings
    #[serde(default)]
    pub critical: Option<u32>,

    #[serde(default)]
    pub high: Option<u32>,

    #[serde(default)]
    pub medium: Option<u32>,

    #[serde(default)]
    pub low: Option<u32>,

    #[serde(default)]
    pub info: Option<u32>,

    /// Build/deploy results must report success
    #[serde(default = "default_true")]
    pub require_success: bool,

    /// Compliance results must report compliant
    #[serde(default = "default_true")]
    pub require_compliant: bool,
}

fn default_true() -> bool {
    true
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            critical: None,
            high: None,
            medium: None,
            low: None,
            info: None,
            require_success: true,
            require_compliant: true,
        }
    }
}

impl Thresholds {
    /// Maximum allowed findings at a severity
    pub fn limit(&self, severity: Severity) -> Option<u32> {
        match severity {
            Severity::Critical => self.critical,
            Severity::High => self.high,
            Severity::Medium => self.medium,
            Severity::Low => self.low,
            Severity::Info => self.info,
        }
    }

    pub fn has_finding_limits(&self) -> bool {
        Severity::ALL.iter().any(|s| self.limit(*s).is_some())
    }
}

/// Outcome of evaluating a stage result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PolicyDecision {
    Pass,

    Fail {
        breaches: Vec<Breach>,
    },

    /// A failure downgraded by a mission-owner risk acceptance
    PassWithException {
        breaches: Vec<Breach>,
        accepted_by: String,
    },

    /// The result cannot be judged against this stage's policy
    Blocked {
        reason: String,
    },
}

impl PolicyDecision {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass | Self::PassWithException { .. })
    }

    pub fn breaches(&self) -> &[Breach] {
        match self {
            Self::Fail { breaches } | Self::PassWithException { breaches, .. } => breaches,
            _ => &[],
        }
    }

    /// Every breach joined for display, e.g. `critical findings 1 > 0; high findings 3 > 0`
    pub fn reason(&self) -> Option<String> {
        match self {
            Self::Pass => None,
            Self::Blocked { reason } => Some(reason.clone()),
            _ => Some(
                self.breaches()
                    .iter()
                    .map(|b| b.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            ),
        }
    }
}

/// Evaluate a raw result against thresholds
pub fn evaluate(thresholds: &Thresholds, result: &ToolResult) -> PolicyDecision {
    let mut breaches = Vec::new();

    match result {
        ToolResult::Scan(report) => {
            for severity in Severity::ALL {
                if let Some(limit) = thresholds.limit(severity) {
                    let actual = report.count(severity);
                    if actual > limit {
                        breaches.push(Breach::Findings {
                            severity,
                            actual,
                            limit,
                        });
                    }
                }
            }
        }
        ToolResult::Compliance(report) => {
            if thresholds.require_compliant && !report.compliant {
                breaches.push(Breach::NonCompliant);
            }
        }
        ToolResult::Build(report) => {
            if thresholds.require_success && !report.success {
                breaches.push(Breach::ExecutionFailed {
                    category: "build".to_string(),
                });
            }
        }
        ToolResult::Deploy(report) => {
            if thresholds.require_success && !report.success {
                breaches.push(Breach::ExecutionFailed {
                    category: "deploy".to_string(),
                });
            }
        }
    }

    if breaches.is_empty() {
        PolicyDecision::Pass
    } else {
        PolicyDecision::Fail { breaches }
    }
}

/// Evaluate a result for a specific stage, blocking on a kind mismatch
pub fn evaluate_stage(stage: &StageDefinition, result: &ToolResult) -> PolicyDecision {
    let matches_kind = matches!(
        (stage.kind, result),
        (StageKind::Scan, ToolResult::Scan(_))
            | (StageKind::Compliance, ToolResult::Compliance(_))
            | (StageKind::Build, ToolResult::Build(_))
            | (StageKind::Deploy, ToolResult::Deploy(_))
    );

    if !matches_kind {
        return PolicyDecision::Blocked {
            reason: format!(
                "stage '{}' expects a {} result but tool '{}' returned {}",
                stage.name,
                stage.kind.as_str(),
                stage.tool,
                result_kind(result)
            ),
        };
    }

    evaluate(&stage.thresholds, result)
}

fn result_kind(result: &ToolResult) -> &'static str {
    match result {
        ToolResult::Scan(_) => "scan",
        ToolResult::Compliance(_) => "compliance",
        ToolResult::Build(_) => "build",
        ToolResult::Deploy(_) => "deploy",
    }
}

/// A mission-owner exception tied to one stage of one change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RiskAcceptance {
    pub change_id: Uuid,
    pub stage: String,
    pub approver: String,
    pub note: String,

    /// Approver's signature over the override message (hex)
    pub signature: String,
}

/// Downgrade a `Fail` to `PassWithException`. Other decisions are unchanged.
pub fn apply_risk_acceptance(decision: PolicyDecision, acceptance: &RiskAcceptance) -> PolicyDecision {
    match decision {
        PolicyDecision::Fail { breaches } => PolicyDecision::PassWithException {
            breaches,
            accepted_by: acceptance.approver.clone(),
        },
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ComplianceReport, ExecutionReport, ScanReport};

    fn zero_tolerance() -> Thresholds {
        Thresholds {
            critical: Some(0),
            high: Some(0),
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_scan_passes() {
        let result = ToolResult::Scan(ScanReport {
            medium: 4,
            ..Default::default()
        });
        assert_eq!(evaluate(&zero_tolerance(), &result), PolicyDecision::Pass);
    }

    #[test]
    fn test_every_breach_reported() {
        let result = ToolResult::Scan(ScanReport {
            critical: 1,
            high: 3,
            ..Default::default()
        });

        let decision = evaluate(&zero_tolerance(), &result);
        assert_eq!(
            decision.reason().as_deref(),
            Some("critical findings 1 > 0; high findings 3 > 0")
        );
        assert_eq!(decision.breaches().len(), 2);
        assert!(!decision.is_pass());
    }

    #[test]
    fn test_unset_limits_ignored() {
        let result = ToolResult::Scan(ScanReport {
            low: 100,
            info: 1000,
            ..Default::default()
        });
        assert!(evaluate(&zero_tolerance(), &result).is_pass());
    }

    #[test]
    fn test_failed_deploy_breaches() {
        let result = ToolResult::Deploy(ExecutionReport {
            success: false,
            reference: None,
        });
        let decision = evaluate(&Thresholds::default(), &result);
        assert_eq!(decision.reason().as_deref(), Some("deploy reported failure"));
    }

    #[test]
    fn test_non_compliance_can_be_tolerated() {
        let result = ToolResult::Compliance(ComplianceReport {
            compliant: false,
            results_ref: None,
        });
        assert!(!evaluate(&Thresholds::default(), &result).is_pass());

        let lenient = Thresholds {
            require_compliant: false,
            ..Default::default()
        };
        assert!(evaluate(&lenient, &result).is_pass());
    }

    #[test]
    fn test_risk_acceptance_downgrades_failure_only() {
        let acceptance = RiskAcceptance {
            change_id: Uuid::new_v4(),
            stage: "sca".to_string(),
            approver: "mo".to_string(),
            note: "vendor patch pending".to_string(),
            signature: String::new(),
        };

        let failed = PolicyDecision::Fail {
            breaches: vec![Breach::NonCompliant],
        };
        let downgraded = apply_risk_acceptance(failed, &acceptance);
        assert!(downgraded.is_pass());
        assert!(matches!(
            downgraded,
            PolicyDecision::PassWithException { ref accepted_by, .. } if accepted_by == "mo"
        ));

        let blocked = PolicyDecision::Blocked {
            reason: "wrong shape".to_string(),
        };
        assert_eq!(
            apply_risk_acceptance(blocked.clone(), &acceptance),
            blocked
        );
    }
}
