//! Secret redaction for captured stage output and log lines.
//!
//! A [`Redactor`] scrubs two things: the exact values of secrets resolved
//! during a run (deploy token, coverage repo token) and pattern rules for
//! secret shapes that can leak without being registered (bearer headers,
//! `NAME=value` assignments of secret variables, PyPI API tokens).

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::error::{CellciError, Result};

/// Replacement text for every redacted value.
pub const REDACTED: &str = "[REDACTED]";

/// Redaction pattern for preventing secret leakage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionRule {
    pub pattern_name: String,
    pub regex_pattern: String,
    pub replacement: String,
}

impl RedactionRule {
    /// `NAME=value` (case-insensitive name) → `NAME=[REDACTED]`.
    pub fn env_var(name: &str) -> Self {
        Self {
            pattern_name: name.to_string(),
            regex_pattern: format!(r"(?i){}=\S+", regex::escape(name)),
            replacement: format!("{}={}", name, REDACTED),
        }
    }

    pub fn bearer_token() -> Self {
        Self {
            pattern_name: "bearer_token".to_string(),
            regex_pattern: r"(?i)bearer\s+[a-zA-Z0-9\-._~+/]+=*".to_string(),
            replacement: format!("Bearer {}", REDACTED),
        }
    }

    /// PyPI API tokens (`pypi-` prefix followed by a macaroon body).
    pub fn pypi_token() -> Self {
        Self {
            pattern_name: "pypi_token".to_string(),
            regex_pattern: r"pypi-[A-Za-z0-9_\-]{16,}".to_string(),
            replacement: REDACTED.to_string(),
        }
    }
}

/// Result of applying redaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionResult {
    pub text: String,
    pub redactions_applied: usize,
    pub rules_matched: Vec<String>,
}

/// Compiled redaction rules plus registered secret values.
#[derive(Debug, Clone)]
pub struct Redactor {
    rules: Vec<(RedactionRule, Regex)>,
    secrets: Vec<String>,
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new()
    }
}

impl Redactor {
    /// Redactor with the builtin bearer and PyPI token rules.
    pub fn new() -> Self {
        let mut redactor = Self::empty();
        for rule in [RedactionRule::bearer_token(), RedactionRule::pypi_token()] {
            if let Ok(re) = Regex::new(&rule.regex_pattern) {
                redactor.rules.push((rule, re));
            }
        }
        redactor
    }

    /// Redactor with no rules at all.
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            secrets: Vec::new(),
        }
    }

    /// Add a pattern rule.
    pub fn with_rule(mut self, rule: RedactionRule) -> Result<Self> {
        let re = Regex::new(&rule.regex_pattern).map_err(|e| {
            CellciError::InvalidRedactionPattern {
                name: rule.pattern_name.clone(),
                reason: e.to_string(),
            }
        })?;
        self.rules.push((rule, re));
        Ok(self)
    }

    /// Register an exact secret value. Empty values are ignored.
    pub fn register_secret(&mut self, value: &str) {
        if value.is_empty() || self.secrets.iter().any(|s| s == value) {
            return;
        }
        self.secrets.push(value.to_string());
        // Longest first so a secret containing another is replaced whole.
        self.secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
    }

    /// Number of registered secret values.
    pub fn secret_count(&self) -> usize {
        self.secrets.len()
    }

    /// Apply exact secrets, then pattern rules.
    pub fn redact(&self, text: &str) -> RedactionResult {
        let mut result = text.to_string();
        let mut count = 0;
        let mut applied_rules = Vec::new();

        for secret in &self.secrets {
            let matches = result.matches(secret.as_str()).count();
            if matches > 0 {
                result = result.replace(secret.as_str(), REDACTED);
                count += matches;
                if !applied_rules.iter().any(|r| r == "registered_secret") {
                    applied_rules.push("registered_secret".to_string());
                }
            }
        }

        for (rule, re) in &self.rules {
            let matches = re.find_iter(&result).count();
            if matches > 0 {
                result = re
                    .replace_all(&result, rule.replacement.as_str())
                    .to_string();
                count += matches;
                applied_rules.push(rule.pattern_name.clone());
            }
        }

        RedactionResult {
            text: result,
            redactions_applied: count,
            rules_matched: applied_rules,
        }
    }

    /// Redacted text only.
    pub fn scrub(&self, text: &str) -> String {
        self.redact(text).text
    }
}
