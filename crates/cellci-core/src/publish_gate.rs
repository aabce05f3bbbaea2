//! Publish gate rules engine.
//!
//! Evaluates a [`PublishCandidate`] against a [`PublishRuleSet`] to produce a
//! [`PublishVerdict`], the pass/fail decision that allows or blocks the
//! deploy phase of a cell. The standard rule set publishes only from the
//! release branch, only after every fatal stage passed, and never for
//! pull-request builds.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Version helpers
// ---------------------------------------------------------------------------

fn release_version_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\d+!)?\d+(\.\d+)*((a|b|rc)\d+)?(\.post\d+)?(\.dev\d+)?$").ok()
    })
    .as_ref()
}

/// Whether `version` is a public PEP 440 version (`1.2`, `0.3.1rc1`,
/// `2.0.post1`, `1!3.0.dev2`). Local versions (`+abc`) are rejected since
/// package indexes refuse them.
pub fn is_release_version(version: &str) -> bool {
    release_version_re()
        .map(|re| re.is_match(version))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Publish candidate (input to the gate)
// ---------------------------------------------------------------------------

/// A cell's state at the point the deploy phase would start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishCandidate {
    /// Branch the run was triggered on.
    pub branch: String,
    /// Trigger event kind (`push`, `cron`, `tag`, `pull_request`, `manual`).
    pub event: String,
    /// Whether every fatal stage before deploy passed.
    pub prior_stages_passed: bool,
    /// Version about to be published, once known.
    pub version: Option<String>,
}

// ---------------------------------------------------------------------------
// Publish rules
// ---------------------------------------------------------------------------

/// A single publish gate rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PublishRule {
    /// Branch must equal `branch` exactly.
    BranchIs { branch: String },
    /// Every fatal stage before deploy must have passed.
    PriorStagesPassed,
    /// Trigger event must be one of `events`.
    EventAllowed { events: Vec<String> },
    /// `version` must be a public PEP 440 version (skipped while unknown).
    VersionFormat,
}

/// A set of publish rules with a fail-fast flag.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishRuleSet {
    pub rules: Vec<PublishRule>,
    pub fail_fast: bool,
}

/// Events that may publish under the standard rule set.
pub const DEFAULT_PUBLISH_EVENTS: &[&str] = &["push", "cron", "tag", "manual"];

impl PublishRuleSet {
    /// Standard rule set: `BranchIs(branch)` + `PriorStagesPassed` +
    /// `EventAllowed(push, cron, tag, manual)` + `VersionFormat`.
    pub fn standard(branch: &str) -> Self {
        Self {
            rules: vec![
                PublishRule::BranchIs {
                    branch: branch.to_string(),
                },
                PublishRule::PriorStagesPassed,
                PublishRule::EventAllowed {
                    events: DEFAULT_PUBLISH_EVENTS
                        .iter()
                        .map(|e| e.to_string())
                        .collect(),
                },
                PublishRule::VersionFormat,
            ],
            fail_fast: false,
        }
    }

    /// Append a rule.
    pub fn with_rule(mut self, rule: PublishRule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// A single rule violation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishViolation {
    pub rule: PublishRule,
    pub reason: String,
}

/// The outcome of evaluating a publish rule set against a candidate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PublishVerdict {
    /// Whether the gate passed (no violations).
    pub passed: bool,
    pub violations: Vec<PublishViolation>,
}

impl PublishVerdict {
    fn pass() -> Self {
        Self {
            passed: true,
            violations: Vec::new(),
        }
    }

    fn fail(violations: Vec<PublishViolation>) -> Self {
        Self {
            passed: false,
            violations,
        }
    }

    /// Violation reasons joined for a single log line.
    pub fn reasons(&self) -> String {
        self.violations
            .iter()
            .map(|v| v.reason.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Evaluate a [`PublishCandidate`] against a [`PublishRuleSet`].
///
/// When `fail_fast` is true, evaluation stops at the first violation.
pub fn evaluate_publish_gate(
    rule_set: &PublishRuleSet,
    candidate: &PublishCandidate,
) -> PublishVerdict {
    let mut violations = Vec::new();

    for rule in &rule_set.rules {
        if let Some(v) = check_rule(rule, candidate) {
            violations.push(v);
            if rule_set.fail_fast {
                break;
            }
        }
    }

    let verdict = if violations.is_empty() {
        PublishVerdict::pass()
    } else {
        PublishVerdict::fail(violations)
    };
    crate::obs::emit_gate_evaluated(
        &candidate.branch,
        verdict.passed,
        verdict.violations.len(),
    );
    verdict
}

fn check_rule(rule: &PublishRule, candidate: &PublishCandidate) -> Option<PublishViolation> {
    match rule {
        PublishRule::BranchIs { branch } => {
            if &candidate.branch == branch {
                None
            } else {
                Some(PublishViolation {
                    rule: rule.clone(),
                    reason: format!(
                        "branch '{}' is not the release branch '{}'",
                        candidate.branch, branch
                    ),
                })
            }
        }

        PublishRule::PriorStagesPassed => {
            if candidate.prior_stages_passed {
                None
            } else {
                Some(PublishViolation {
                    rule: rule.clone(),
                    reason: "a fatal stage before deploy did not pass".to_string(),
                })
            }
        }

        PublishRule::EventAllowed { events } => {
            if events.iter().any(|e| e == &candidate.event) {
                None
            } else {
                Some(PublishViolation {
                    rule: rule.clone(),
                    reason: format!("event '{}' may not publish", candidate.event),
                })
            }
        }

        PublishRule::VersionFormat => {
            let version = candidate.version.as_deref()?;
            if is_release_version(version) {
                None
            } else {
                Some(PublishViolation {
                    rule: rule.clone(),
                    reason: format!("'{}' is not a publishable PEP 440 version", version),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_versions() {
        for v in ["1.0", "0.3.1", "2.0rc1", "1.0.post2", "1.1.dev3", "1!2.0"] {
            assert!(is_release_version(v), "{v} should be accepted");
        }
        for v in ["", "v1.0", "1.0+local", "latest", "1..0"] {
            assert!(!is_release_version(v), "{v} should be rejected");
        }
    }

    #[test]
    fn verdict_reasons_join() {
        let verdict = PublishVerdict::fail(vec![
            PublishViolation {
                rule: PublishRule::PriorStagesPassed,
                reason: "a".to_string(),
            },
            PublishViolation {
                rule: PublishRule::VersionFormat,
                reason: "b".to_string(),
            },
        ]);
        assert_eq!(verdict.reasons(), "a; b");
    }
}
