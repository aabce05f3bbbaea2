//! SurrealDB schema initialization
//!
//! Defines the `runs` and `run_events` tables with their indexes. Safe to
//! call on every connection.

use crate::Result;
use surrealdb::engine::any::Any;
use surrealdb::Surreal;
use tracing::{debug, info};

/// Initialize all cellci tables
pub async fn init_schema(db: &Surreal<Any>) -> Result<()> {
    info!("Initializing cellci ledger schema");

    init_runs_table(db).await?;
    init_run_events_table(db).await?;

    info!("cellci ledger schema ready");
    Ok(())
}

/// Initialize `runs` table
///
/// ```text
/// TABLE runs {
///   run_id:        STRING (unique)
///   spec_digest:   STRING (indexed)
///   git_sha:       STRING?
///   label:         STRING (indexed)
///   tags:          OBJECT
///   status:        STRING (running | completed | failed | cancelled)
///   total_events:  INT
///   duration_ms:   INT
///   success:       BOOL
///   created_at:    DATETIME (indexed)
///   completed_at:  DATETIME?
/// }
/// ```
///
/// Status transitions are enforced by the ledger, not the database.
async fn init_runs_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing runs table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS runs SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_run_id ON TABLE runs COLUMNS run_id UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_spec_digest ON TABLE runs COLUMNS spec_digest;
        DEFINE INDEX IF NOT EXISTS idx_label ON TABLE runs COLUMNS label;
        DEFINE INDEX IF NOT EXISTS idx_created_at ON TABLE runs COLUMNS created_at;
    "#;

    db.query(sql).await?;
    Ok(())
}

/// Initialize `run_events` table
///
/// `(run_id, seq)` is unique: a run can never hold two events with the
/// same sequence number.
async fn init_run_events_table(db: &Surreal<Any>) -> Result<()> {
    debug!("Initializing run_events table");

    let sql = r#"
        DEFINE TABLE IF NOT EXISTS run_events SCHEMALESS;
        DEFINE INDEX IF NOT EXISTS idx_run_id_seq ON TABLE run_events COLUMNS run_id, seq UNIQUE;
        DEFINE INDEX IF NOT EXISTS idx_event_run_id ON TABLE run_events COLUMNS run_id;
        DEFINE INDEX IF NOT EXISTS idx_kind ON TABLE run_events COLUMNS kind;
    "#;

    db.query(sql).await?;
    Ok(())
}
