//! Cell run recorder: bridges domain `Event`s to `RunLedger` persistence.

use std::sync::Arc;

use cellci_state::{
    ContentDigest, RunEvent, RunId, RunLedger, RunMetadata, RunSummary, StorageResult,
};

use crate::domain::run::Event;

/// Records a cell's [`Event`]s into a [`RunLedger`].
///
/// Usage:
/// 1. [`CellRunRecorder::start`] creates the run.
/// 2. [`CellRunRecorder::record`] appends each event.
/// 3. [`CellRunRecorder::finish_ok`] or [`CellRunRecorder::finish_err`] finalizes it.
pub struct CellRunRecorder {
    ledger: Arc<dyn RunLedger>,
    run_id: RunId,
}

impl CellRunRecorder {
    /// Start a new run in the ledger, returning a recorder bound to it.
    pub async fn start(
        ledger: Arc<dyn RunLedger>,
        spec_digest: &ContentDigest,
        metadata: RunMetadata,
    ) -> StorageResult<Self> {
        let run_id = ledger.create_run(spec_digest, metadata.clone()).await?;
        crate::obs::emit_cell_started(run_id.0.as_str(), &metadata.label);
        Ok(Self { ledger, run_id })
    }

    /// Record a single domain event.
    pub async fn record(&self, event: &Event) -> StorageResult<()> {
        let kind = event.kind.as_str();
        let run_event = RunEvent {
            seq: event.seq,
            kind: kind.to_string(),
            payload: event.ledger_payload(),
            timestamp: event.timestamp,
        };
        crate::obs::emit_event_appended(&self.run_id.0, kind, event.seq);
        self.ledger.append_event(&self.run_id, run_event).await
    }

    /// Finalize the run as completed.
    pub async fn finish_ok(self, summary: RunSummary) -> StorageResult<()> {
        crate::obs::emit_cell_finished(
            &self.run_id.0,
            summary.duration_ms,
            summary.total_events,
            true,
        );
        self.ledger.complete_run(&self.run_id, summary).await
    }

    /// Finalize the run as failed.
    pub async fn finish_err(self, summary: RunSummary) -> StorageResult<()> {
        crate::obs::emit_cell_finished(
            &self.run_id.0,
            summary.duration_ms,
            summary.total_events,
            false,
        );
        self.ledger.fail_run(&self.run_id, summary).await
    }

    /// Return a reference to the run ID.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }
}
