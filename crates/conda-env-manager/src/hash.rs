//! Environment hashing
//!
//! A content-addressable identifier for everything that determines what a
//! cell's conda environment contains, so two runs with the same hash were
//! provisioned from the same inputs.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::environment::CondaSpec;
use crate::Result;

/// Files in the workspace that pin dependencies beyond the conda spec.
const LOCK_FILES: &[&str] = &["environment.yml", "requirements.txt", "setup.py", "setup.cfg"];

/// Environment hash
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentHash {
    /// The SHA256 hash
    pub hash: String,
    pub source: HashSource,
}

/// What went into the hash
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HashSource {
    /// Spec plus the workspace's dependency files
    SpecAndFiles,
    /// Spec alone (no dependency files in the workspace)
    Spec,
}

impl std::fmt::Display for EnvironmentHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.hash)
    }
}

impl EnvironmentHash {
    /// Get short hash (first 12 characters)
    pub fn short(&self) -> &str {
        &self.hash[..12.min(self.hash.len())]
    }
}

/// Generate the environment hash for `spec` installed from `workspace`.
///
/// The spec is hashed as canonical JSON, followed by each dependency file
/// found (name, then contents) in a fixed order.
pub fn generate_environment_hash(
    spec: &CondaSpec,
    installer_url: &str,
    workspace: &Path,
) -> Result<EnvironmentHash> {
    let mut hasher = Sha256::new();
    hasher.update(serde_json::to_vec(spec)?);
    hasher.update(b"\0");
    hasher.update(installer_url.as_bytes());

    let mut files_seen = 0;
    for name in LOCK_FILES {
        let path = workspace.join(name);
        if path.is_file() {
            let content = std::fs::read(&path)?;
            hasher.update(b"\0");
            hasher.update(name.as_bytes());
            hasher.update(b"\0");
            hasher.update(&content);
            files_seen += 1;
        }
    }

    let source = if files_seen > 0 {
        HashSource::SpecAndFiles
    } else {
        HashSource::Spec
    };
    let hash = hex::encode(hasher.finalize());
    debug!(hash = %&hash[..12], files = files_seen, "Environment hash generated");
    Ok(EnvironmentHash { hash, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::InstallMode;
    use tempfile::tempdir;

    fn spec(python: &str) -> CondaSpec {
        CondaSpec {
            env_name: "test-environment".to_string(),
            python_version: python.to_string(),
            channels: vec!["statkraft".to_string()],
            conda_packages: vec!["shyft".to_string()],
            pip_packages: vec!["coveralls".to_string(), "pytest-cov".to_string()],
            install_mode: InstallMode::Standard,
        }
    }

    #[test]
    fn hash_is_deterministic() {
        let dir = tempdir().unwrap();
        let a = generate_environment_hash(&spec("3.7"), "u", dir.path()).unwrap();
        let b = generate_environment_hash(&spec("3.7"), "u", dir.path()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.hash.len(), 64);
        assert_eq!(a.source, HashSource::Spec);
    }

    #[test]
    fn python_version_changes_hash() {
        let dir = tempdir().unwrap();
        let a = generate_environment_hash(&spec("3.6"), "u", dir.path()).unwrap();
        let b = generate_environment_hash(&spec("3.7"), "u", dir.path()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn changing_setup_py_changes_hash() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("setup.py"), "version='1.0'").unwrap();
        let a = generate_environment_hash(&spec("3.7"), "u", dir.path()).unwrap();
        assert_eq!(a.source, HashSource::SpecAndFiles);

        std::fs::write(dir.path().join("setup.py"), "version='1.1'").unwrap();
        let b = generate_environment_hash(&spec("3.7"), "u", dir.path()).unwrap();
        assert_ne!(a, b);
    }
}
