//! Contract tests for RunLedger.
//!
//! Every check runs against both the in-memory fake and the SurrealDB
//! ledger (`mem://`). Any conforming implementation must pass these.

use cellci_state::fakes::MemoryRunLedger;
use cellci_state::storage_traits::*;
use cellci_state::{StorageError, SurrealRunLedger};
use chrono::Utc;

fn sample_metadata(label: &str) -> RunMetadata {
    RunMetadata {
        git_sha: Some("abc123".to_string()),
        label: label.to_string(),
        tags: serde_json::json!({ "arch": "amd64", "python": "3.7" }),
    }
}

fn sample_event(seq: u64, kind: &str) -> RunEvent {
    RunEvent {
        seq,
        kind: kind.to_string(),
        payload: serde_json::json!({ "stage": "pytest" }),
        timestamp: Utc::now(),
    }
}

fn sample_summary(total_events: u64, success: bool) -> RunSummary {
    RunSummary {
        total_events,
        duration_ms: 1500,
        success,
    }
}

async fn ledgers() -> Vec<Box<dyn RunLedger>> {
    vec![
        Box::new(MemoryRunLedger::new()),
        Box::new(SurrealRunLedger::in_memory().await.expect("surreal mem ledger")),
    ]
}

#[tokio::test]
async fn ledger_create_run_returns_unique_ids() {
    for ledger in ledgers().await {
        let digest = ContentDigest::from_bytes(b"cell");
        let a = ledger
            .create_run(&digest, sample_metadata("a"))
            .await
            .unwrap();
        let b = ledger
            .create_run(&digest, sample_metadata("b"))
            .await
            .unwrap();
        assert_ne!(a, b);
    }
}

#[tokio::test]
async fn ledger_get_run_returns_created_run() {
    for ledger in ledgers().await {
        let digest = ContentDigest::from_bytes(b"cell");
        let id = ledger
            .create_run(&digest, sample_metadata("weather@amd64-py3.7"))
            .await
            .unwrap();

        let run = ledger.get_run(&id).await.unwrap();
        assert_eq!(run.run_id, id);
        assert_eq!(run.spec_digest, digest);
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.metadata.label, "weather@amd64-py3.7");
        assert!(run.summary.is_none());
    }
}

#[tokio::test]
async fn ledger_get_run_not_found() {
    for ledger in ledgers().await {
        let err = ledger
            .get_run(&RunId("does-not-exist".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::RunNotFound { .. }));
    }
}

#[tokio::test]
async fn ledger_append_and_get_events_ordered() {
    for ledger in ledgers().await {
        let id = ledger
            .create_run(&ContentDigest::from_bytes(b"cell"), sample_metadata("x"))
            .await
            .unwrap();

        ledger
            .append_event(&id, sample_event(2, "stage_succeeded"))
            .await
            .unwrap();
        ledger
            .append_event(&id, sample_event(1, "stage_started"))
            .await
            .unwrap();

        let events = ledger.get_events(&id).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].seq, 1);
        assert_eq!(events[0].kind, "stage_started");
        assert_eq!(events[1].seq, 2);
    }
}

#[tokio::test]
async fn ledger_complete_run_sets_status() {
    for ledger in ledgers().await {
        let id = ledger
            .create_run(&ContentDigest::from_bytes(b"cell"), sample_metadata("x"))
            .await
            .unwrap();
        ledger
            .complete_run(&id, sample_summary(3, true))
            .await
            .unwrap();

        let run = ledger.get_run(&id).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        let summary = run.summary.expect("summary");
        assert_eq!(summary.total_events, 3);
        assert!(summary.success);
        assert!(run.completed_at.is_some());
    }
}

#[tokio::test]
async fn ledger_fail_run_sets_status() {
    for ledger in ledgers().await {
        let id = ledger
            .create_run(&ContentDigest::from_bytes(b"cell"), sample_metadata("x"))
            .await
            .unwrap();
        ledger.fail_run(&id, sample_summary(2, false)).await.unwrap();

        let run = ledger.get_run(&id).await.unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(!run.summary.unwrap().success);
    }
}

#[tokio::test]
async fn ledger_cannot_append_to_completed_run() {
    for ledger in ledgers().await {
        let id = ledger
            .create_run(&ContentDigest::from_bytes(b"cell"), sample_metadata("x"))
            .await
            .unwrap();
        ledger
            .complete_run(&id, sample_summary(0, true))
            .await
            .unwrap();

        let err = ledger
            .append_event(&id, sample_event(1, "stage_started"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidRunState { .. }));
    }
}

#[tokio::test]
async fn ledger_cannot_complete_twice() {
    for ledger in ledgers().await {
        let id = ledger
            .create_run(&ContentDigest::from_bytes(b"cell"), sample_metadata("x"))
            .await
            .unwrap();
        ledger.cancel_run(&id, sample_summary(0, false)).await.unwrap();

        let err = ledger
            .complete_run(&id, sample_summary(0, true))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidRunState { .. }));
    }
}

#[tokio::test]
async fn ledger_list_runs_filtered_by_spec() {
    for ledger in ledgers().await {
        let amd = ContentDigest::from_bytes(b"amd64-3.7");
        let arm = ContentDigest::from_bytes(b"arm64-3.7");
        ledger.create_run(&amd, sample_metadata("a")).await.unwrap();
        ledger.create_run(&amd, sample_metadata("b")).await.unwrap();
        ledger.create_run(&arm, sample_metadata("c")).await.unwrap();

        assert_eq!(ledger.list_runs(None).await.unwrap().len(), 3);

        let filtered = ledger.list_runs(Some(&amd)).await.unwrap();
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|r| r.spec_digest == amd));
    }
}

#[tokio::test]
async fn ledger_rejects_duplicate_sequence_numbers() {
    for ledger in ledgers().await {
        let digest = ContentDigest::from_bytes(b"cell");
        let first = ledger.create_run(&digest, sample_metadata("a")).await.unwrap();
        let second = ledger.create_run(&digest, sample_metadata("b")).await.unwrap();

        ledger
            .append_event(&first, sample_event(1, "cell_started"))
            .await
            .unwrap();
        let err = ledger
            .append_event(&first, sample_event(1, "stage_started"))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::DuplicateEvent { seq: 1, .. }));

        // Sequence numbers are scoped to their run.
        ledger
            .append_event(&second, sample_event(1, "cell_started"))
            .await
            .unwrap();
        assert_eq!(ledger.get_events(&first).await.unwrap().len(), 1);
    }
}
