//! Error types for cellci-state

use thiserror::Error;

/// Errors raised while connecting to or preparing the backing database
#[derive(Error, Debug)]
pub enum StateError {
    /// Database connection error
    #[error("Database connection failed: {0}")]
    Connection(String),

    /// Database query error
    #[error("Database query failed: {0}")]
    Query(String),

    /// Serialization error
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Schema setup error
    #[error("Schema setup failed: {0}")]
    SchemaSetup(String),
}

impl From<surrealdb::Error> for StateError {
    fn from(err: surrealdb::Error) -> Self {
        StateError::Query(err.to_string())
    }
}

impl From<serde_json::Error> for StateError {
    fn from(err: serde_json::Error) -> Self {
        StateError::Serialization(err.to_string())
    }
}

/// Errors returned by [`crate::RunLedger`] implementations
#[derive(Error, Debug)]
pub enum StorageError {
    /// No run with this ID exists
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    /// The run is not in the state the operation requires
    #[error("run {run_id} is {status}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        status: String,
        expected: String,
    },

    /// The run already holds an event with this sequence number
    #[error("run {run_id} already has event #{seq}")]
    DuplicateEvent { run_id: String, seq: u64 },

    /// A digest string was not 64 hex characters
    #[error("invalid content digest: {digest}")]
    InvalidDigest { digest: String },

    /// Backend failure (query, connection, decoding)
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StateError> for StorageError {
    fn from(err: StateError) -> Self {
        StorageError::Backend(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_error_display_names_the_run() {
        let err = StorageError::InvalidRunState {
            run_id: "run-1".to_string(),
            status: "Completed".to_string(),
            expected: "Running".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("run-1"));
        assert!(msg.contains("expected Running"));
    }

    #[test]
    fn state_error_converts_to_backend() {
        let err: StorageError = StateError::Connection("refused".to_string()).into();
        assert!(matches!(err, StorageError::Backend(ref m) if m.contains("refused")));
    }
}
