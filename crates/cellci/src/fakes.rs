//! In-memory implementations of the external service seams, for tests.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use conda_env_manager::{EnvError, InstallerSource};

use crate::coverage::{CoverageJob, CoverageReport, CoverageSink};
use crate::credential::DeployToken;
use crate::error::{CoverageError, PublishError};
use crate::publish::{DistArtifact, PackageIndex, UploadOutcome};

/// Package index that stores filenames. A second upload of the same
/// filename answers `AlreadyExists`, like a real index.
#[derive(Default)]
pub struct MemoryPackageIndex {
    files: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<String>>,
    /// Tokens accepted; empty accepts any.
    accepted_tokens: Vec<String>,
}

impl MemoryPackageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only accept these token values.
    pub fn with_accepted_tokens(tokens: &[&str]) -> Self {
        Self {
            accepted_tokens: tokens.iter().map(|t| t.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Pre-populate a file, as if published by an earlier run.
    pub fn insert(&self, filename: &str) {
        if let Ok(mut files) = self.files.lock() {
            files.insert(filename.to_string());
        }
    }

    pub fn contains(&self, filename: &str) -> bool {
        self.files
            .lock()
            .map(|f| f.contains(filename))
            .unwrap_or(false)
    }

    /// Filenames of every upload attempt, in order.
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().map(|a| a.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl PackageIndex for MemoryPackageIndex {
    async fn upload(
        &self,
        artifact: &DistArtifact,
        token: &DeployToken,
    ) -> Result<UploadOutcome, PublishError> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push(artifact.filename.clone());
        }
        if !self.accepted_tokens.is_empty()
            && !self
                .accepted_tokens
                .iter()
                .any(|t| t == token.secret.expose_secret())
        {
            return Err(PublishError::Unauthorized { status: 403 });
        }
        let mut files = self
            .files
            .lock()
            .map_err(|_| PublishError::Http("index lock poisoned".to_string()))?;
        if files.insert(artifact.filename.clone()) {
            Ok(UploadOutcome::Uploaded)
        } else {
            Ok(UploadOutcome::AlreadyExists)
        }
    }
}

/// Coverage sink that keeps every upload.
#[derive(Default)]
pub struct RecordingCoverageSink {
    uploads: Mutex<Vec<(String, f64)>>,
}

impl RecordingCoverageSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(flag_name, percent)` per upload.
    pub fn uploads(&self) -> Vec<(String, f64)> {
        self.uploads.lock().map(|u| u.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CoverageSink for RecordingCoverageSink {
    async fn upload(
        &self,
        report: &CoverageReport,
        job: &CoverageJob,
    ) -> Result<(), CoverageError> {
        if let Ok(mut uploads) = self.uploads.lock() {
            uploads.push((job.flag_name.clone(), report.percent()));
        }
        Ok(())
    }
}

/// Coverage sink that is always unreachable.
#[derive(Default)]
pub struct FailingCoverageSink;

#[async_trait]
impl CoverageSink for FailingCoverageSink {
    async fn upload(
        &self,
        _report: &CoverageReport,
        _job: &CoverageJob,
    ) -> Result<(), CoverageError> {
        Err(CoverageError::Http("connection refused".to_string()))
    }
}

/// Installer source that writes a fixed script instead of downloading.
pub struct StaticInstallerSource {
    script: String,
}

impl StaticInstallerSource {
    pub fn new(script: &str) -> Self {
        Self {
            script: script.to_string(),
        }
    }
}

#[async_trait]
impl InstallerSource for StaticInstallerSource {
    async fn fetch(&self, _url: &str, dest: &Path) -> Result<u64, EnvError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, self.script.as_bytes()).await?;
        Ok(self.script.len() as u64)
    }
}

/// Installer source whose server is down.
#[derive(Default)]
pub struct UnreachableInstallerSource;

#[async_trait]
impl InstallerSource for UnreachableInstallerSource {
    async fn fetch(&self, url: &str, _dest: &Path) -> Result<u64, EnvError> {
        Err(EnvError::DownloadStatus {
            url: url.to_string(),
            status: 503,
        })
    }
}
