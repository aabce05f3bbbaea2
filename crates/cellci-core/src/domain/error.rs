//! Domain-level error taxonomy for cellci.

/// cellci domain errors.
#[derive(Debug, thiserror::Error)]
pub enum CellciError {
    #[error("invalid cell spec: {0}")]
    InvalidCellSpec(String),

    #[error("invalid publish rule set: {0}")]
    InvalidRuleSet(String),

    #[error("git error: {0}")]
    GitError(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("invalid redaction pattern {name}: {reason}")]
    InvalidRedactionPattern { name: String, reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<cellci_state::StorageError> for CellciError {
    fn from(err: cellci_state::StorageError) -> Self {
        CellciError::StorageError(err.to_string())
    }
}

/// Result type for cellci domain operations.
pub type Result<T> = std::result::Result<T, CellciError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cellci_error_display() {
        let err = CellciError::InvalidCellSpec("empty stage list".to_string());
        assert!(err.to_string().contains("invalid cell spec"));

        let err = CellciError::GitError("not a repository".to_string());
        assert!(err.to_string().contains("git error"));
    }

    #[test]
    fn test_storage_error_conversion() {
        let err: CellciError = cellci_state::StorageError::RunNotFound {
            run_id: "run-9".to_string(),
        }
        .into();
        assert!(err.to_string().contains("storage error"));
        assert!(err.to_string().contains("run-9"));
    }
}
