//! Error types for the cellci pipeline seams.

use std::path::PathBuf;

use thiserror::Error;

/// Pipeline configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// One or more fields failed validation; messages are `field: reason`.
    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Deploy credential resolution errors. Never carries the secret itself.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential variable {var} is not set")]
    Unavailable { var: String },

    #[error("credential variable {var} is empty")]
    Empty { var: String },
}

/// Package index upload errors.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("package index rejected the credentials (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("package index refused {filename} (HTTP {status}): {message}")]
    Rejected {
        filename: String,
        status: u16,
        message: String,
    },

    #[error("invalid distribution artifact: {0}")]
    InvalidArtifact(String),

    #[error("no distribution artifacts found in {0}")]
    NoArtifacts(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for PublishError {
    fn from(err: reqwest::Error) -> Self {
        PublishError::Http(err.without_url().to_string())
    }
}

/// Coverage parsing and upload errors.
#[derive(Error, Debug)]
pub enum CoverageError {
    #[error("failed to read coverage report {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read covered source {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no source digest for {path}; read the sources before uploading")]
    MissingDigest { path: String },

    #[error("malformed coverage report: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("coverage service answered HTTP {status}: {message}")]
    Rejected { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for CoverageError {
    fn from(err: reqwest::Error) -> Self {
        CoverageError::Http(err.without_url().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_joins_messages() {
        let err = ConfigError::Invalid(vec![
            "matrix.architectures: empty".to_string(),
            "package.name: empty".to_string(),
        ]);
        assert_eq!(
            err.to_string(),
            "invalid config: matrix.architectures: empty; package.name: empty"
        );
    }

    #[test]
    fn credential_error_names_variable_only() {
        let err = CredentialError::Unavailable {
            var: "PYPI_TOKEN".to_string(),
        };
        assert_eq!(err.to_string(), "credential variable PYPI_TOKEN is not set");
    }
}
