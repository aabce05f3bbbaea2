//! Deploy credentials.
//!
//! The hosting CI hands the executing process the plaintext token through
//! its environment. cellci resolves it only inside the deploy stage, keeps it
//! in a [`SecretString`] that never prints, and registers it with the cell's
//! redactor before first use.

use std::collections::HashMap;
use std::fmt;

use cellci_core::REDACTED;

use crate::error::CredentialError;

/// A string that never appears in `Debug` or `Display` output.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// The plaintext, for the single request that needs it.
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(REDACTED)
    }
}

/// Package index credential.
#[derive(Clone, Debug)]
pub struct DeployToken {
    pub username: String,
    pub secret: SecretString,
}

/// Where secrets are looked up.
pub trait SecretSource: Send + Sync {
    fn get(&self, name: &str) -> Option<String>;
}

/// The executing process's environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSecretSource;

impl SecretSource for EnvSecretSource {
    fn get(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl SecretSource for HashMap<String, String> {
    fn get(&self, name: &str) -> Option<String> {
        HashMap::get(self, name).cloned()
    }
}

/// Resolve the deploy token from `var`.
pub fn resolve_deploy_token(
    source: &dyn SecretSource,
    var: &str,
    username: &str,
) -> Result<DeployToken, CredentialError> {
    let value = source.get(var).ok_or_else(|| CredentialError::Unavailable {
        var: var.to_string(),
    })?;
    if value.trim().is_empty() {
        return Err(CredentialError::Empty {
            var: var.to_string(),
        });
    }
    Ok(DeployToken {
        username: username.to_string(),
        secret: SecretString::new(value),
    })
}

/// Resolve an optional secret (e.g. the coverage repo token).
pub fn resolve_optional(source: &dyn SecretSource, var: &str) -> Option<SecretString> {
    source
        .get(var)
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn secret_never_formats() {
        let token = DeployToken {
            username: "__token__".to_string(),
            secret: SecretString::new("pypi-supersecret"),
        };
        let debug = format!("{:?}", token);
        assert!(!debug.contains("supersecret"));
        assert!(debug.contains(REDACTED));
        assert_eq!(format!("{}", token.secret), REDACTED);
        assert_eq!(token.secret.expose_secret(), "pypi-supersecret");
    }

    #[test]
    fn missing_variable_is_unavailable() {
        let err = resolve_deploy_token(&source(&[]), "PYPI_TOKEN", "__token__").unwrap_err();
        assert_eq!(
            err,
            CredentialError::Unavailable {
                var: "PYPI_TOKEN".to_string()
            }
        );
    }

    #[test]
    fn blank_variable_is_empty() {
        let err =
            resolve_deploy_token(&source(&[("PYPI_TOKEN", "  ")]), "PYPI_TOKEN", "__token__")
                .unwrap_err();
        assert!(matches!(err, CredentialError::Empty { .. }));
    }

    #[test]
    fn resolves_token() {
        let token =
            resolve_deploy_token(&source(&[("PYPI_TOKEN", "abc")]), "PYPI_TOKEN", "__token__")
                .unwrap();
        assert_eq!(token.username, "__token__");
        assert_eq!(token.secret.expose_secret(), "abc");
    }

    #[test]
    fn optional_secret() {
        let s = source(&[("COVERALLS_REPO_TOKEN", "r"), ("BLANK", "")]);
        assert!(resolve_optional(&s, "COVERALLS_REPO_TOKEN").is_some());
        assert!(resolve_optional(&s, "BLANK").is_none());
        assert!(resolve_optional(&s, "MISSING").is_none());
    }
}
