#![allow(clippy::unwrap_used, clippy::expect_used)]

use cadence_core::*;
use std::collections::BTreeMap;

// ---------------------------------------------------------------------------
// 1. Error Display and From impls
// ---------------------------------------------------------------------------

#[test]
fn error_display_and_from_impls() {
    let dup = CadenceError::DuplicateTask("analyze".to_string());
    assert_eq!(dup.to_string(), "duplicate task: analyze");

    let cycle = CadenceError::Cycle {
        task_id: "plan".to_string(),
        depends_on: "package".to_string(),
    };
    assert_eq!(
        cycle.to_string(),
        "dependency plan -> package would create a cycle"
    );

    let transition = CadenceError::InvalidStateTransition {
        task_id: "translate".to_string(),
        from: "completed".to_string(),
        to: "completed".to_string(),
    };
    assert_eq!(
        transition.to_string(),
        "task translate: invalid transition completed -> completed"
    );

    let config_err = CadenceError::Config("missing key".to_string());
    assert_eq!(config_err.to_string(), "Config error: missing key");

    // From<serde_json::Error> conversion
    let bad_json = serde_json::from_str::<serde_json::Value>("not json");
    let err: CadenceError = bad_json.unwrap_err().into();
    assert!(err.to_string().starts_with("JSON error:"));

    // From<std::io::Error> conversion
    let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
    let err: CadenceError = io_err.into();
    assert!(err.to_string().starts_with("IO error:"));
}

// ---------------------------------------------------------------------------
// 2. Contract violations are distinguished from task failures
// ---------------------------------------------------------------------------

#[test]
fn contract_violations_are_classified() {
    assert!(CadenceError::UnknownTask("x".into()).is_contract_violation());
    assert!(CadenceError::InvalidWorkflowDefinition("empty".into()).is_contract_violation());
    assert!(!CadenceError::PoolShutdown.is_contract_violation());
    assert!(!CadenceError::OrchestrationDeadlock { pending: vec![] }.is_contract_violation());
}

// ---------------------------------------------------------------------------
// 3. Workflow-level failures expose their report
// ---------------------------------------------------------------------------

#[test]
fn fallback_exhausted_carries_partial_results() {
    let mut partial = BTreeMap::new();
    partial.insert("analyze".to_string(), serde_json::json!({"entities": 2}));

    let err = CadenceError::FallbackExhausted {
        strategy: "parallel_adaptive".to_string(),
        report: Box::new(FailureReport {
            partial_results: partial,
            failed_tasks: vec![TaskFailure {
                task_id: "translate".to_string(),
                attempts: 3,
                error: ExecutionError::Timeout { timeout_ms: 500 },
                optional: false,
            }],
            skipped_tasks: vec!["package".to_string(), "validate".to_string()],
        }),
    };

    let report = err.report().unwrap();
    assert_eq!(report.partial_results.len(), 1);
    assert_eq!(report.required_failures(), vec!["translate"]);
    assert_eq!(report.skipped_tasks.len(), 2);
    assert!(err.to_string().contains("parallel_adaptive"));

    assert!(CadenceError::PoolShutdown.report().is_none());
}

// ---------------------------------------------------------------------------
// 4. ExecutionError serializes with a kind tag
// ---------------------------------------------------------------------------

#[test]
fn execution_error_serialization() {
    let json = serde_json::to_value(ExecutionError::Timeout { timeout_ms: 250 }).unwrap();
    assert_eq!(json["kind"], "timeout");
    assert_eq!(json["timeout_ms"], 250);

    let parsed: ExecutionError =
        serde_json::from_str(r#"{"kind":"failed","message":"503","retryable":true}"#).unwrap();
    assert_eq!(parsed, ExecutionError::transient("503"));
}
