//! In-memory fakes for storage traits (testing only)
//!
//! `MemoryRunLedger` satisfies the `RunLedger` contract without any
//! external dependencies.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::StorageError;
use crate::storage_traits::*;

#[derive(Debug)]
struct CellRun {
    record: RunRecord,
    events: Vec<RunEvent>,
}

impl CellRun {
    /// Reject writes once the run reached a terminal status.
    fn ensure_running(&self) -> StorageResult<()> {
        if self.record.status == RunStatus::Running {
            return Ok(());
        }
        Err(StorageError::InvalidRunState {
            run_id: self.record.run_id.0.clone(),
            status: format!("{:?}", self.record.status),
            expected: "Running".to_string(),
        })
    }
}

/// In-memory run ledger keyed by run id.
#[derive(Debug, Default)]
pub struct MemoryRunLedger {
    runs: Mutex<HashMap<String, CellRun>>,
}

impl MemoryRunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded runs in any status.
    pub fn len(&self) -> usize {
        self.runs.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_run<T>(
        &self,
        run_id: &RunId,
        f: impl FnOnce(&mut CellRun) -> StorageResult<T>,
    ) -> StorageResult<T> {
        let mut runs = self.runs.lock().unwrap();
        let run = runs
            .get_mut(&run_id.0)
            .ok_or_else(|| StorageError::RunNotFound {
                run_id: run_id.0.clone(),
            })?;
        f(run)
    }

    fn finish(&self, run_id: &RunId, status: RunStatus, summary: RunSummary) -> StorageResult<()> {
        self.with_run(run_id, |run| {
            run.ensure_running()?;
            run.record.status = status;
            run.record.summary = Some(summary);
            run.record.completed_at = Some(Utc::now());
            Ok(())
        })
    }
}

#[async_trait]
impl RunLedger for MemoryRunLedger {
    async fn create_run(
        &self,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<RunId> {
        let run_id = RunId::new();
        let run = CellRun {
            record: RunRecord {
                run_id: run_id.clone(),
                spec_digest: spec_digest.clone(),
                metadata,
                status: RunStatus::Running,
                summary: None,
                created_at: Utc::now(),
                completed_at: None,
            },
            events: Vec::new(),
        };
        self.runs.lock().unwrap().insert(run_id.0.clone(), run);
        Ok(run_id)
    }

    async fn append_event(&self, run_id: &RunId, event: RunEvent) -> StorageResult<()> {
        self.with_run(run_id, |run| {
            run.ensure_running()?;
            if run.events.iter().any(|e| e.seq == event.seq) {
                return Err(StorageError::DuplicateEvent {
                    run_id: run_id.0.clone(),
                    seq: event.seq,
                });
            }
            run.events.push(event);
            Ok(())
        })
    }

    async fn complete_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Completed, summary)
    }

    async fn fail_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Failed, summary)
    }

    async fn cancel_run(&self, run_id: &RunId, summary: RunSummary) -> StorageResult<()> {
        self.finish(run_id, RunStatus::Cancelled, summary)
    }

    async fn get_run(&self, run_id: &RunId) -> StorageResult<RunRecord> {
        self.with_run(run_id, |run| Ok(run.record.clone()))
    }

    async fn get_events(&self, run_id: &RunId) -> StorageResult<Vec<RunEvent>> {
        self.with_run(run_id, |run| {
            let mut events = run.events.clone();
            events.sort_by_key(|e| e.seq);
            Ok(events)
        })
    }

    async fn list_runs(
        &self,
        spec_digest: Option<&ContentDigest>,
    ) -> StorageResult<Vec<RunRecord>> {
        let runs = self.runs.lock().unwrap();
        let mut records: Vec<RunRecord> = runs
            .values()
            .map(|run| &run.record)
            .filter(|record| spec_digest.map_or(true, |d| record.spec_digest == *d))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }
}
