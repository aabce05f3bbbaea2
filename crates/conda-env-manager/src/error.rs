//! Error types for conda-env-manager

use thiserror::Error;

/// Errors that can occur while provisioning a conda environment
#[derive(Error, Debug)]
pub enum EnvError {
    /// Architecture has no conda installer build
    #[error("Unsupported architecture: {0}")]
    UnsupportedArchitecture(String),

    /// Installer URL template is unusable
    #[error("Invalid installer URL template: {0}")]
    InvalidTemplate(String),

    /// Installer server answered with a non-success status
    #[error("Installer download from {url} failed with status {status}")]
    DownloadStatus { url: String, status: u16 },

    /// Installer download produced no bytes
    #[error("Installer download from {0} was empty")]
    EmptyInstaller(String),

    /// Interpreter version selector is malformed
    #[error("Invalid python version: {0}")]
    InvalidPythonVersion(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(String),
}

impl From<reqwest::Error> for EnvError {
    fn from(err: reqwest::Error) -> Self {
        EnvError::Http(err.to_string())
    }
}
