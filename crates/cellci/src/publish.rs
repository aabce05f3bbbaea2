//! Distribution artifacts and package index upload.
//!
//! Upload follows the legacy upload API shared by PyPI-compatible indexes:
//! one multipart `POST` per file with token basic auth. An index that already
//! holds the file answers 400 (PyPI) or 409 with "already exists"; that is
//! reported as [`UploadOutcome::AlreadyExists`] so a re-run of an unchanged
//! version succeeds.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::credential::DeployToken;
use crate::error::PublishError;

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactKind {
    Sdist,
    Wheel {
        pyversion: String,
        abi: String,
        platform: String,
    },
}

impl ArtifactKind {
    /// `filetype` form value.
    pub fn filetype(&self) -> &'static str {
        match self {
            ArtifactKind::Sdist => "sdist",
            ArtifactKind::Wheel { .. } => "bdist_wheel",
        }
    }

    /// `pyversion` form value.
    pub fn pyversion(&self) -> &str {
        match self {
            ArtifactKind::Sdist => "source",
            ArtifactKind::Wheel { pyversion, .. } => pyversion,
        }
    }
}

/// A built file in the dist directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistArtifact {
    pub path: PathBuf,
    pub filename: String,
    pub kind: ArtifactKind,
    pub name: String,
    pub version: String,
    pub sha256: String,
    pub size: u64,
}

/// Split a distribution filename into kind, project name and version.
/// Returns `None` for files that are not distributions.
pub fn classify_artifact(filename: &str) -> Option<(ArtifactKind, String, String)> {
    if let Some(stem) = filename.strip_suffix(".whl") {
        let parts: Vec<&str> = stem.split('-').collect();
        // name-version(-build)?-pyversion-abi-platform
        if parts.len() != 5 && parts.len() != 6 {
            return None;
        }
        let n = parts.len();
        return Some((
            ArtifactKind::Wheel {
                pyversion: parts[n - 3].to_string(),
                abi: parts[n - 2].to_string(),
                platform: parts[n - 1].to_string(),
            },
            parts[0].to_string(),
            parts[1].to_string(),
        ));
    }

    let stem = filename
        .strip_suffix(".tar.gz")
        .or_else(|| filename.strip_suffix(".zip"))?;
    let (name, version) = stem.rsplit_once('-')?;
    if name.is_empty() || version.is_empty() {
        return None;
    }
    Some((ArtifactKind::Sdist, name.to_string(), version.to_string()))
}

impl DistArtifact {
    /// Inspect one file. Non-distribution files give `Ok(None)`.
    pub fn from_path(path: &Path) -> Result<Option<Self>, PublishError> {
        let Some(filename) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(None);
        };
        let Some((kind, name, version)) = classify_artifact(filename) else {
            return Ok(None);
        };
        let bytes = std::fs::read(path)?;
        let sha256 = hex::encode(Sha256::digest(&bytes));
        Ok(Some(Self {
            path: path.to_path_buf(),
            filename: filename.to_string(),
            kind,
            name,
            version,
            sha256,
            size: bytes.len() as u64,
        }))
    }
}

/// Every distribution in `dist_dir`, sorted by filename (sdists and wheels
/// of one version sort together).
pub fn discover_artifacts(dist_dir: &Path) -> Result<Vec<DistArtifact>, PublishError> {
    if !dist_dir.is_dir() {
        return Err(PublishError::NoArtifacts(dist_dir.to_path_buf()));
    }
    let mut artifacts = Vec::new();
    for entry in std::fs::read_dir(dist_dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        if let Some(artifact) = DistArtifact::from_path(&path)? {
            artifacts.push(artifact);
        }
    }
    if artifacts.is_empty() {
        return Err(PublishError::NoArtifacts(dist_dir.to_path_buf()));
    }
    artifacts.sort_by(|a, b| a.filename.cmp(&b.filename));
    Ok(artifacts)
}

// ---------------------------------------------------------------------------
// Index
// ---------------------------------------------------------------------------

/// Result of one upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadOutcome {
    Uploaded,
    /// The index already holds this file; counts as success.
    AlreadyExists,
}

impl UploadOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadOutcome::Uploaded => "uploaded",
            UploadOutcome::AlreadyExists => "already_exists",
        }
    }
}

/// A package index accepting uploads.
#[async_trait]
pub trait PackageIndex: Send + Sync {
    async fn upload(
        &self,
        artifact: &DistArtifact,
        token: &DeployToken,
    ) -> Result<UploadOutcome, PublishError>;
}

/// Legacy-upload-API index over HTTP.
pub struct HttpPackageIndex {
    repository_url: String,
    http_client: reqwest::Client,
}

impl HttpPackageIndex {
    pub fn new(repository_url: &str) -> Result<Self, PublishError> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("cellci/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            repository_url: repository_url.to_string(),
            http_client,
        })
    }

    async fn build_form(
        &self,
        artifact: &DistArtifact,
    ) -> Result<reqwest::multipart::Form, PublishError> {
        let bytes = tokio::fs::read(&artifact.path).await?;
        let content = reqwest::multipart::Part::bytes(bytes)
            .file_name(artifact.filename.clone())
            .mime_str("application/octet-stream")?;

        let mut form = reqwest::multipart::Form::new()
            .text(":action", "file_upload")
            .text("protocol_version", "1")
            .text("metadata_version", "2.1")
            .text("name", artifact.name.clone())
            .text("version", artifact.version.clone())
            .text("filetype", artifact.kind.filetype())
            .text("pyversion", artifact.kind.pyversion().to_string())
            .text("sha256_digest", artifact.sha256.clone())
            .text("size", artifact.size.to_string());
        if let ArtifactKind::Wheel { abi, platform, .. } = &artifact.kind {
            form = form.text("abi", abi.clone()).text("platform", platform.clone());
        }
        Ok(form.part("content", content))
    }
}

/// Whether a rejection means the file is already on the index.
fn is_already_exists(status: StatusCode, body: &str) -> bool {
    (status == StatusCode::BAD_REQUEST || status == StatusCode::CONFLICT)
        && body.to_ascii_lowercase().contains("already exist")
}

#[async_trait]
impl PackageIndex for HttpPackageIndex {
    async fn upload(
        &self,
        artifact: &DistArtifact,
        token: &DeployToken,
    ) -> Result<UploadOutcome, PublishError> {
        let form = self.build_form(artifact).await?;
        debug!(
            filename = %artifact.filename,
            sha256 = %&artifact.sha256[..artifact.sha256.len().min(12)],
            "Uploading artifact"
        );

        let response = self
            .http_client
            .post(&self.repository_url)
            .basic_auth(&token.username, Some(token.secret.expose_secret()))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            info!(filename = %artifact.filename, "Artifact uploaded");
            return Ok(UploadOutcome::Uploaded);
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(PublishError::Unauthorized {
                status: status.as_u16(),
            });
        }

        let reason = status.canonical_reason().unwrap_or_default().to_string();
        let body = response.text().await.unwrap_or_default();
        if is_already_exists(status, &format!("{reason} {body}")) {
            info!(filename = %artifact.filename, "Artifact already on index");
            return Ok(UploadOutcome::AlreadyExists);
        }

        Err(PublishError::Rejected {
            filename: artifact.filename.clone(),
            status: status.as_u16(),
            message: body.chars().take(200).collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_sdist() {
        let (kind, name, version) = classify_artifact("weather-1.0.tar.gz").unwrap();
        assert_eq!(kind, ArtifactKind::Sdist);
        assert_eq!(name, "weather");
        assert_eq!(version, "1.0");

        let (_, name, version) = classify_artifact("my_weather-0.3.1rc1.zip").unwrap();
        assert_eq!(name, "my_weather");
        assert_eq!(version, "0.3.1rc1");
    }

    #[test]
    fn classify_wheel() {
        let (kind, name, version) =
            classify_artifact("weather-1.0-py3-none-any.whl").unwrap();
        assert_eq!(name, "weather");
        assert_eq!(version, "1.0");
        assert_eq!(
            kind,
            ArtifactKind::Wheel {
                pyversion: "py3".to_string(),
                abi: "none".to_string(),
                platform: "any".to_string(),
            }
        );
        assert_eq!(kind.filetype(), "bdist_wheel");
    }

    #[test]
    fn classify_ignores_other_files() {
        assert!(classify_artifact("README.txt").is_none());
        assert!(classify_artifact("weather.tar.gz").is_none());
        assert!(classify_artifact("weather-1.0.whl").is_none());
    }

    #[test]
    fn discover_skips_non_distributions_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("weather-1.0.tar.gz"), b"sdist").unwrap();
        std::fs::write(dir.path().join("weather-1.0-py3-none-any.whl"), b"wheel").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"x").unwrap();

        let artifacts = discover_artifacts(dir.path()).unwrap();
        let names: Vec<&str> = artifacts.iter().map(|a| a.filename.as_str()).collect();
        assert_eq!(names, vec!["weather-1.0-py3-none-any.whl", "weather-1.0.tar.gz"]);
        assert_eq!(artifacts[1].size, 5);
        assert_eq!(artifacts[1].sha256, hex::encode(Sha256::digest(b"sdist")));
    }

    #[test]
    fn discover_empty_dir_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            discover_artifacts(dir.path()),
            Err(PublishError::NoArtifacts(_))
        ));
        assert!(matches!(
            discover_artifacts(&dir.path().join("missing")),
            Err(PublishError::NoArtifacts(_))
        ));
    }

    #[test]
    fn already_exists_detection() {
        assert!(is_already_exists(
            StatusCode::BAD_REQUEST,
            "File already exists. See https://pypi.org/help/#file-name-reuse"
        ));
        assert!(is_already_exists(StatusCode::CONFLICT, "Conflict: already exists"));
        assert!(!is_already_exists(StatusCode::BAD_REQUEST, "Invalid version"));
        assert!(!is_already_exists(StatusCode::INTERNAL_SERVER_ERROR, "already exists"));
    }
}
