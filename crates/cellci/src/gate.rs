//! Re-derive a cell's pass/fail verdict from its recorded events.

use std::collections::BTreeSet;

use cellci_state::RunEvent;
use serde::{Deserialize, Serialize};

/// Gate evaluation verdict.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// CI gate evaluation rules.
pub struct CiGate;

impl CiGate {
    /// Evaluate whether every fatal stage of a recorded cell passed.
    ///
    /// - `stage_failed` with `fatal: true` is a violation.
    /// - `stage_failed` with `fatal: false` (coverage upload, publish) is not.
    /// - A `stage_started` with no later `stage_succeeded` / `stage_failed`
    ///   is a violation (the cell was interrupted).
    pub fn evaluate(events: &[RunEvent]) -> GateVerdict {
        let mut violations = Vec::new();
        let mut started = BTreeSet::new();
        let mut finished = BTreeSet::new();

        for event in events {
            let stage = event.payload["stage"]
                .as_str()
                .unwrap_or("unknown")
                .to_string();
            match event.kind.as_str() {
                "stage_started" => {
                    started.insert(stage);
                }
                "stage_succeeded" => {
                    finished.insert(stage);
                }
                "stage_failed" => {
                    if event.payload["fatal"].as_bool().unwrap_or(true) {
                        let exit_code = event.payload["exit_code"].as_i64().unwrap_or(-1);
                        violations.push(format!(
                            "Stage '{}' failed with exit code {}",
                            stage, exit_code
                        ));
                    }
                    finished.insert(stage);
                }
                _ => {}
            }
        }

        for stage in started.difference(&finished) {
            violations.push(format!("Stage '{}' was started but never finished", stage));
        }

        let passed = violations.is_empty();
        let message = if passed {
            "All fatal stages passed".to_string()
        } else {
            format!("Gate failed with {} violation(s)", violations.len())
        };

        GateVerdict {
            passed,
            violations,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn ev(seq: u64, kind: &str, payload: serde_json::Value) -> RunEvent {
        RunEvent {
            seq,
            kind: kind.to_string(),
            payload,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_empty_events_passes() {
        assert!(CiGate::evaluate(&[]).passed);
    }

    #[test]
    fn test_single_successful_stage() {
        let events = vec![
            ev(1, "stage_started", json!({ "stage": "pytest" })),
            ev(2, "stage_succeeded", json!({ "stage": "pytest", "exit_code": 0 })),
        ];
        let verdict = CiGate::evaluate(&events);
        assert!(verdict.passed);
        assert!(verdict.violations.is_empty());
    }

    #[test]
    fn fatal_failure_is_violation() {
        let events = vec![
            ev(1, "stage_started", json!({ "stage": "pytest" })),
            ev(
                2,
                "stage_failed",
                json!({ "stage": "pytest", "exit_code": 1, "fatal": true }),
            ),
        ];
        let verdict = CiGate::evaluate(&events);
        assert!(!verdict.passed);
        assert!(verdict.violations[0].contains("exit code 1"));
    }

    #[test]
    fn non_fatal_failure_passes() {
        let events = vec![
            ev(1, "stage_started", json!({ "stage": "coverage" })),
            ev(
                2,
                "stage_failed",
                json!({ "stage": "coverage", "exit_code": -1, "fatal": false }),
            ),
            ev(3, "stage_started", json!({ "stage": "publish" })),
            ev(
                4,
                "stage_failed",
                json!({ "stage": "publish", "exit_code": -1, "fatal": false }),
            ),
        ];
        assert!(CiGate::evaluate(&events).passed);
    }

    #[test]
    fn started_but_never_finished() {
        let events = vec![ev(1, "stage_started", json!({ "stage": "conda-create" }))];
        let verdict = CiGate::evaluate(&events);
        assert!(!verdict.passed);
        assert_eq!(verdict.violations.len(), 1);
        assert!(verdict.violations[0].contains("never finished"));
    }

    #[test]
    fn skipped_stages_are_ignored() {
        let events = vec![ev(1, "stage_skipped", json!({ "stage": "publish" }))];
        assert!(CiGate::evaluate(&events).passed);
    }
}
