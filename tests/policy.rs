//! Policy Evaluation Property Tests

use proptest::prelude::*;
use uuid::Uuid;

use gatechain::core::policy::apply_risk_acceptance;
use gatechain::core::{
    evaluate, evaluate_stage, PipelineDefinition, PolicyDecision, RiskAcceptance, Thresholds,
};
use gatechain::domain::{Breach, ExecutionReport, ScanReport, Severity, ToolResult};

fn scan_report() -> impl Strategy<Value = ScanReport> {
    (0u32..12, 0u32..12, 0u32..50, 0u32..50, 0u32..100).prop_map(
        |(critical, high, medium, low, info)| ScanReport {
            critical,
            high,
            medium,
            low,
            info,
            results_ref: None,
        },
    )
}

fn thresholds() -> impl Strategy<Value = Thresholds> {
    let limit = || proptest::option::of(0u32..10);
    (limit(), limit(), limit(), limit(), limit()).prop_map(|(critical, high, medium, low, info)| {
        Thresholds {
            critical,
            high,
            medium,
            low,
            info,
            ..Default::default()
        }
    })
}

fn acceptance() -> RiskAcceptance {
    RiskAcceptance {
        change_id: Uuid::new_v4(),
        stage: "sca".to_string(),
        approver: "olivia".to_string(),
        note: "accepted".to_string(),
        signature: String::new(),
    }
}

proptest! {
    #[test]
    fn evaluation_is_deterministic(t in thresholds(), report in scan_report()) {
        let result = ToolResult::Scan(report);
        prop_assert_eq!(evaluate(&t, &result), evaluate(&t, &result));
    }

    #[test]
    fn passes_exactly_when_within_every_limit(t in thresholds(), report in scan_report()) {
        let within = Severity::ALL
            .iter()
            .all(|s| t.limit(*s).map_or(true, |limit| report.count(*s) <= limit));

        let decision = evaluate(&t, &ToolResult::Scan(report));
        prop_assert_eq!(decision.is_pass(), within);
    }

    #[test]
    fn every_exceeded_limit_is_reported(t in thresholds(), report in scan_report()) {
        let exceeded: Vec<Severity> = Severity::ALL
            .into_iter()
            .filter(|s| t.limit(*s).map_or(false, |limit| report.count(*s) > limit))
            .collect();

        let decision = evaluate(&t, &ToolResult::Scan(report.clone()));
        let reported: Vec<Severity> = decision
            .breaches()
            .iter()
            .map(|b| match b {
                Breach::Findings { severity, actual, limit } => {
                    assert_eq!(*actual, report.count(*severity));
                    assert!(actual > limit);
                    *severity
                }
                other => panic!("unexpected breach {:?}", other),
            })
            .collect();

        prop_assert_eq!(reported, exceeded);
    }

    #[test]
    fn risk_acceptance_keeps_breaches(t in thresholds(), report in scan_report()) {
        let decision = evaluate(&t, &ToolResult::Scan(report));
        let accepted = apply_risk_acceptance(decision.clone(), &acceptance());

        prop_assert!(accepted.is_pass());
        prop_assert_eq!(accepted.breaches(), decision.breaches());
        if decision.is_pass() {
            prop_assert_eq!(accepted, PolicyDecision::Pass);
        }
    }
}

#[test]
fn test_no_thresholds_always_pass_scans() {
    let report = ScanReport {
        critical: 99,
        ..Default::default()
    };
    assert_eq!(
        evaluate(&Thresholds::default(), &ToolResult::Scan(report)),
        PolicyDecision::Pass
    );
}

#[test]
fn test_failed_deploy_is_a_policy_failure() {
    let decision = evaluate(
        &Thresholds::default(),
        &ToolResult::Deploy(ExecutionReport {
            success: false,
            reference: None,
        }),
    );
    assert_eq!(decision.reason().as_deref(), Some("deploy reported failure"));

    let lenient = Thresholds {
        require_success: false,
        ..Default::default()
    };
    let decision = evaluate(
        &lenient,
        &ToolResult::Deploy(ExecutionReport {
            success: false,
            reference: None,
        }),
    );
    assert!(decision.is_pass());
}

#[test]
fn test_result_of_wrong_kind_blocks() {
    let pipeline = PipelineDefinition::from_yaml(
        r#"
name: kinds
stages:
  - { name: build, kind: build, tool: builder }
"#,
    )
    .unwrap();

    let decision = evaluate_stage(
        &pipeline.stages[0],
        &ToolResult::Scan(ScanReport::default()),
    );

    match decision {
        PolicyDecision::Blocked { reason } => {
            assert!(reason.contains("expects a build result"));
            assert!(reason.contains("returned scan"));
        }
        other => panic!("expected Blocked, got {:?}", other),
    }
}
