//! Conda bootstrap installer download
//!
//! The installer is a self-extracting shell script published per platform.
//! cellci renders a version-pinned URL template for the cell's architecture
//! and downloads it in-process before running it in batch mode.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::EnvError;
use crate::Result;

/// Default version-pinned installer location.
pub const DEFAULT_INSTALLER_URL: &str =
    "https://repo.anaconda.com/miniconda/Miniconda3-py37_4.9.2-Linux-{arch}.sh";

/// Platform suffix used in installer file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InstallerArch {
    X86_64,
    Aarch64,
}

impl InstallerArch {
    /// Map a matrix architecture label (`amd64`, `arm64`) to the installer
    /// platform. The installer names themselves are accepted too.
    pub fn from_matrix_arch(arch: &str) -> Result<Self> {
        match arch {
            "amd64" | "x86_64" => Ok(Self::X86_64),
            "arm64" | "aarch64" => Ok(Self::Aarch64),
            other => Err(EnvError::UnsupportedArchitecture(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Aarch64 => "aarch64",
        }
    }
}

impl std::fmt::Display for InstallerArch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Render an installer URL template for `arch`.
///
/// The template must contain exactly the `{arch}` placeholder; a template
/// without it would fetch the same binary for every architecture.
pub fn installer_url(template: &str, arch: InstallerArch) -> Result<String> {
    if !template.contains("{arch}") {
        return Err(EnvError::InvalidTemplate(format!(
            "'{}' has no {{arch}} placeholder",
            template
        )));
    }
    Ok(template.replace("{arch}", arch.as_str()))
}

/// Where bootstrap installers come from.
#[async_trait]
pub trait InstallerSource: Send + Sync {
    /// Download `url` into `dest`, returning the number of bytes written.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// Installer source backed by plain HTTP(S) GETs.
pub struct HttpInstallerSource {
    http_client: reqwest::Client,
}

impl HttpInstallerSource {
    pub fn new() -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(concat!("cellci-conda-env-manager/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { http_client })
    }
}

#[async_trait]
impl InstallerSource for HttpInstallerSource {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        info!(url = %url, "Downloading conda installer");

        let mut response = self.http_client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(EnvError::DownloadStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut written: u64 = 0;
        while let Some(chunk) = response.chunk().await? {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if written == 0 {
            return Err(EnvError::EmptyInstaller(url.to_string()));
        }
        debug!(bytes = written, dest = %dest.display(), "Installer downloaded");
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matrix_arch_maps_to_installer_platform() {
        assert_eq!(
            InstallerArch::from_matrix_arch("amd64").unwrap(),
            InstallerArch::X86_64
        );
        assert_eq!(
            InstallerArch::from_matrix_arch("arm64").unwrap(),
            InstallerArch::Aarch64
        );
        assert!(matches!(
            InstallerArch::from_matrix_arch("ppc64le"),
            Err(EnvError::UnsupportedArchitecture(_))
        ));
    }

    #[test]
    fn default_template_renders_per_arch() {
        let amd = installer_url(DEFAULT_INSTALLER_URL, InstallerArch::X86_64).unwrap();
        let arm = installer_url(DEFAULT_INSTALLER_URL, InstallerArch::Aarch64).unwrap();
        assert!(amd.ends_with("Linux-x86_64.sh"));
        assert!(arm.ends_with("Linux-aarch64.sh"));
    }

    #[test]
    fn template_without_placeholder_rejected() {
        let err = installer_url("https://example.com/Miniconda3-latest.sh", InstallerArch::X86_64)
            .unwrap_err();
        assert!(matches!(err, EnvError::InvalidTemplate(_)));
    }
}
