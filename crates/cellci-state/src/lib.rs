//! cellci-state: run ledger persistence for cellci
//!
//! Every matrix cell execution is recorded as a run: an ordered list of
//! stage events plus a terminal summary. The [`RunLedger`] trait is the
//! seam; [`fakes::MemoryRunLedger`] backs tests and [`SurrealRunLedger`]
//! persists to SurrealDB (in-memory, remote or local `surrealkv`).

mod error;
pub mod fakes;
mod migrations;
mod schema;
pub mod storage_traits;
pub mod surreal_ledger;

pub use error::{StateError, StorageError};
pub use storage_traits::{
    ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunRecord, RunStatus, RunSummary,
    StorageResult,
};
pub use surreal_ledger::{LedgerConfig, SurrealRunLedger};

/// Result type for cellci-state connection and schema operations
pub type Result<T> = std::result::Result<T, StateError>;
