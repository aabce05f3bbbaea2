//! Cell run identity.

use std::path::PathBuf;

use cellci_state::ContentDigest;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Everything that determines what a cell run does.
///
/// Its [`digest`](CellSpec::digest) keys the run in the ledger, so runs of
/// the same cell at the same commit with the same environment group together.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CellSpec {
    /// Workspace root path.
    pub workspace_path: PathBuf,

    /// SHA-256 digest of ordered stage names (deterministic).
    pub stages_digest: String,

    /// Git commit SHA being built (empty when unknown).
    pub git_sha: String,

    /// Matrix cell id, e.g. `amd64-3.7`.
    pub cell_id: String,

    /// Environment hash from the conda spec and dependency files.
    pub env_hash: String,
}

impl CellSpec {
    pub fn new(
        workspace_path: PathBuf,
        stages: &[String],
        git_sha: String,
        cell_id: String,
        env_hash: String,
    ) -> Self {
        let stages_digest = compute_stages_digest(stages);
        Self {
            workspace_path,
            stages_digest,
            git_sha,
            cell_id,
            env_hash,
        }
    }

    /// Content digest over all fields, in declaration order.
    pub fn digest(&self) -> ContentDigest {
        let mut hasher = Sha256::new();
        for part in [
            &*self.workspace_path.to_string_lossy(),
            self.stages_digest.as_str(),
            self.git_sha.as_str(),
            self.cell_id.as_str(),
            self.env_hash.as_str(),
        ] {
            hasher.update(part.as_bytes());
            hasher.update(b"\0");
        }
        ContentDigest::from_bytes(&hasher.finalize())
    }
}

/// Compute deterministic digest of ordered stage names.
fn compute_stages_digest(stages: &[String]) -> String {
    let mut hasher = Sha256::new();
    for stage in stages {
        hasher.update(stage.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(cell: &str, stages: &[&str]) -> CellSpec {
        CellSpec::new(
            PathBuf::from("."),
            &stages.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            "abc123".to_string(),
            cell.to_string(),
            "envhash".to_string(),
        )
    }

    #[test]
    fn test_stages_digest_deterministic() {
        assert_eq!(
            spec("amd64-3.7", &["pytest", "publish"]).digest(),
            spec("amd64-3.7", &["pytest", "publish"]).digest()
        );
    }

    #[test]
    fn test_stages_digest_order_sensitive() {
        assert_ne!(
            compute_stages_digest(&["fmt".to_string(), "check".to_string()]),
            compute_stages_digest(&["check".to_string(), "fmt".to_string()])
        );
    }

    #[test]
    fn cells_have_distinct_digests() {
        assert_ne!(
            spec("amd64-3.6", &["pytest"]).digest(),
            spec("amd64-3.7", &["pytest"]).digest()
        );
    }
}
