//! SurrealDB-backed RunLedger implementation
//!
//! Uses `schema::RunRow` and `schema::RunEventRow` for persistence,
//! converting to/from `storage_traits` types at the boundary.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use surrealdb::engine::any::Any;
use surrealdb::opt::auth::{Database, Root};
use surrealdb::Surreal;
use tracing::{debug, info};

use crate::error::{StateError, StorageError};
use crate::migrations;
use crate::schema::{RunEventRow, RunRow};
use crate::storage_traits::{
    ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunRecord, RunStatus, RunSummary,
    StorageResult,
};

const NAMESPACE: &str = "cellci";
const DATABASE: &str = "main";

/// Where the ledger lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerConfig {
    /// Ephemeral `mem://` database.
    Memory,
    /// Any SurrealDB URL (`ws://`, `surrealkv://`, ...), unauthenticated.
    Url(String),
    /// Authenticated remote database.
    Cloud {
        endpoint: String,
        username: String,
        password: String,
        namespace: String,
        database: String,
        is_root: bool,
    },
    /// Local `surrealkv` directory.
    Local(PathBuf),
}

impl LedgerConfig {
    /// Resolve from environment variables, falling back to a local directory.
    ///
    /// Reads, in order:
    /// - SURREALDB_ENDPOINT + SURREALDB_USERNAME + SURREALDB_PASSWORD
    ///   (optional SURREALDB_NAMESPACE, SURREALDB_DATABASE, SURREALDB_ROOT)
    /// - SURREALDB_URL
    pub fn from_env(default_dir: &Path) -> Self {
        let cloud = (
            std::env::var("SURREALDB_ENDPOINT"),
            std::env::var("SURREALDB_USERNAME"),
            std::env::var("SURREALDB_PASSWORD"),
        );
        if let (Ok(endpoint), Ok(username), Ok(password)) = cloud {
            return LedgerConfig::Cloud {
                endpoint,
                username,
                password,
                namespace: std::env::var("SURREALDB_NAMESPACE")
                    .unwrap_or_else(|_| NAMESPACE.to_string()),
                database: std::env::var("SURREALDB_DATABASE")
                    .unwrap_or_else(|_| DATABASE.to_string()),
                is_root: std::env::var("SURREALDB_ROOT")
                    .map(|v| v.eq_ignore_ascii_case("true"))
                    .unwrap_or(false),
            };
        }

        if let Ok(url) = std::env::var("SURREALDB_URL") {
            return LedgerConfig::Url(url);
        }

        LedgerConfig::Local(default_dir.to_path_buf())
    }
}

/// SurrealDB-backed implementation of [`RunLedger`].
pub struct SurrealRunLedger {
    db: Surreal<Any>,
}

impl SurrealRunLedger {
    /// Create an in-memory instance for testing.
    pub async fn in_memory() -> crate::Result<Self> {
        Self::connect(&LedgerConfig::Memory).await
    }

    /// Connect according to `config`, select the namespace and run the schema.
    pub async fn connect(config: &LedgerConfig) -> crate::Result<Self> {
        let (db, ns, database) = match config {
            LedgerConfig::Memory => (open("mem://").await?, NAMESPACE, DATABASE),
            LedgerConfig::Url(url) => (open(url).await?, NAMESPACE, DATABASE),
            LedgerConfig::Local(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    StateError::Connection(format!(
                        "Failed to create database directory {}: {}",
                        dir.display(),
                        e
                    ))
                })?;
                let url = format!("surrealkv://{}", dir.display());
                (open(&url).await?, NAMESPACE, DATABASE)
            }
            LedgerConfig::Cloud {
                endpoint,
                username,
                password,
                namespace,
                database,
                is_root,
            } => {
                let db = open(endpoint).await?;
                if *is_root {
                    db.signin(Root { username, password })
                        .await
                        .map_err(|e| StateError::Connection(format!("Root auth failed: {e}")))?;
                } else {
                    db.signin(Database {
                        namespace,
                        database,
                        username,
                        password,
                    })
                    .await
                    .map_err(|e| StateError::Connection(format!("DB auth failed: {e}")))?;
                }
                (db, namespace.as_str(), database.as_str())
            }
        };

        db.use_ns(ns)
            .use_db(database)
            .await
            .map_err(|e| StateError::Connection(e.to_string()))?;

        migrations::init_schema(&db).await?;
        info!(backend = ?backend_label(config), "SurrealRunLedger connected");
        Ok(Self { db })
    }

    /// Fetch a run row by ID, returning RunNotFound when absent.
    async fn fetch_run(&self, rid: &str) -> StorageResult<RunRow> {
        let mut res = self
            .db
            .query("SELECT * FROM runs WHERE run_id = $rid")
            .bind(("rid", rid.to_string()))
            .await
            .map_err(backend)?;

        let rows: Vec<RunRow> = res.take(0).map_err(backend)?;

        rows.into_iter()
            .next()
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: rid.to_string(),
            })
    }

    /// Fetch a run row and verify it is still running.
    async fn fetch_running(&self, rid: &str) -> StorageResult<RunRow> {
        let row = self.fetch_run(rid).await?;
        if row.status != RunStatus::Running.as_str() {
            return Err(StorageError::InvalidRunState {
                run_id: rid.to_string(),
                status: row.status,
                expected: "Running".to_string(),
            });
        }
        Ok(row)
    }

    async fn finish(
        &self,
        run_id: &RunId,
        status: RunStatus,
        summary: RunSummary,
    ) -> StorageResult<()> {
        self.fetch_running(&run_id.0).await?;

        self.db
            .query(
                "UPDATE runs SET status = $status, total_events = $total, \
                 duration_ms = $duration, success = $success, completed_at = time::now() \
                 WHERE run_id = $rid",
            )
            .bind(("status", status.as_str().to_string()))
            .bind(("total", summary.total_events))
            .bind(("duration", summary.duration_ms))
            .bind(("success", summary.success))
            .bind(("rid", run_id.0.clone()))
            .await
            .map_err(backend)?;

        debug!(run_id = %run_id, status = status.as_str(), "run finished");
        Ok(())
    }

    fn row_to_record(row: RunRow) -> StorageResult<RunRecord> {
        let status = match row.status.as_str() {
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            "failed" => RunStatus::Failed,
            "cancelled" => RunStatus::Cancelled,
            other => {
                return Err(StorageError::Backend(format!(
                    "unknown run status: {other}"
                )))
            }
        };

        let summary = (status != RunStatus::Running).then(|| RunSummary {
            total_events: row.total_events,
            duration_ms: row.duration_ms,
            success: row.success,
        });

        Ok(RunRecord {
            run_id: RunId(row.run_id),
            spec_digest: ContentDigest::try_from(row.spec_digest)?,
            metadata: RunMetadata {
                git_sha: row.git_sha,
                label: row.label,
                tags: row.tags,
            },
            status,
            summary,
            created_at: row.created_at,
            completed_at: row.completed_at,
        })
    }
}

async fn open(url: &str) -> crate::Result<Surreal<Any>> {
    surrealdb::engine::any::connect(url)
        .await
        .map_err(|e| StateError::Connection(format!("Failed to connect to {url}: {e}")))
}

#[derive(Deserialize)]
struct SeqRow {
    seq: u64,
}

fn backend(e: surrealdb::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Config description without credentials, for logging.
fn backend_label(config: &LedgerConfig) -> String {
    match config {
        LedgerConfig::Memory => "mem://".to_string(),
        LedgerConfig::Url(url) => url.clone(),
        LedgerConfig::Cloud { endpoint, .. } => endpoint.clone(),
        LedgerConfig::Local(dir) => format!("surrealkv://{}", dir.display()),
    }
}

#[async_trait]
impl RunLedger for SurrealRunLedger {
    async fn create_run(
        &self,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let row = RunRow::new(
            run_id.0.clone(),
            spec_digest.as_str().to_string(),
            metadata.git_sha,
            metadata.label,
            metadata.tags,
        );

        debug!(run_id = %run_id, "creating run");

        let _created: Option<RunRow> = self
            .db
            .create("runs")
            .content(row)
            .await
            .map_err(backend)?;

        Ok(run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        self.fetch_running(&run_id.0).await?;

        let mut res = self
            .db
            .query("SELECT seq FROM run_events WHERE run_id = $rid AND seq = $seq")
            .bind(("rid", run_id.0.clone()))
            .bind(("seq", event.seq))
            .await
            .map_err(backend)?;
        let existing: Vec<SeqRow> = res.take(0).map_err(backend)?;
        if existing.iter().any(|r| r.seq == event.seq) {
            return Err(StorageError::DuplicateEvent {
                run_id: run_id.0.clone(),
                seq: event.seq,
            });
        }

        let row = RunEventRow::new(
            run_id.0.clone(),
            event.seq,
            event.kind,
            event.payload,
            event.timestamp,
        );

        let _created: Option<RunEventRow> = self
            .db
            .create("run_events")
            .content(row)
            .await
            .map_err(backend)?;

        Ok(())
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Completed, summary).await
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Failed, summary).await
    }

    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Cancelled, summary).await
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        let row = self.fetch_run(&run_id.0).await?;
        Self::row_to_record(row)
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        self.fetch_run(&run_id.0).await?;

        let mut res = self
            .db
            .query("SELECT * FROM run_events WHERE run_id = $rid ORDER BY seq ASC")
            .bind(("rid", run_id.0.clone()))
            .await
            .map_err(backend)?;

        let rows: Vec<RunEventRow> = res.take(0).map_err(backend)?;

        Ok(rows
            .into_iter()
            .map(|row| RunEvent {
                seq: row.seq,
                kind: row.kind,
                payload: row.payload,
                timestamp: row.timestamp,
            })
            .collect())
    }

    async fn list_runs(
        &self,
        spec_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>> {
        let mut res = match spec_digest {
            Some(digest) => self
                .db
                .query("SELECT * FROM runs WHERE spec_digest = $sd ORDER BY created_at DESC")
                .bind(("sd", digest.as_str().to_string()))
                .await
                .map_err(backend)?,
            None => self
                .db
                .query("SELECT * FROM runs ORDER BY created_at DESC")
                .await
                .map_err(backend)?,
        };

        let rows: Vec<RunRow> = res.take(0).map_err(backend)?;
        rows.into_iter().map(Self::row_to_record).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_label_hides_credentials() {
        let config = LedgerConfig::Cloud {
            endpoint: "wss://db.example".to_string(),
            username: "ci".to_string(),
            password: "hunter2".to_string(),
            namespace: "cellci".to_string(),
            database: "main".to_string(),
            is_root: false,
        };
        let label = backend_label(&config);
        assert_eq!(label, "wss://db.example");
        assert!(!label.contains("hunter2"));
    }

    #[test]
    fn local_label_uses_surrealkv_scheme() {
        let label = backend_label(&LedgerConfig::Local(PathBuf::from(".cellci/db")));
        assert_eq!(label, "surrealkv://.cellci/db");
    }
}
