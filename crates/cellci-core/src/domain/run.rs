//! Cell run events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of an event in a cell run.
///
/// The serde tag (`type`) is the event kind string stored in the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// Cell execution started (environment not yet provisioned).
    CellStarted,

    /// Every fatal stage passed.
    CellCompleted,

    /// A fatal stage failed; the cell was aborted.
    CellFailed,

    /// A stage began executing.
    StageStarted { stage: String },

    /// A stage exited successfully.
    StageSucceeded { stage: String },

    /// A stage failed. The payload carries `fatal`.
    StageFailed { stage: String },

    /// A stage was not run (earlier failure, or gate closed).
    StageSkipped { stage: String },

    /// Coverage report parsed and scoped to the package.
    CoverageMeasured,

    /// Coverage accepted by the aggregation service.
    CoverageUploaded,

    /// Coverage upload failed (non-fatal).
    CoverageUploadFailed,

    /// Publish gate evaluated; payload carries the verdict.
    PublishGateEvaluated,

    /// An artifact was uploaded to the package index.
    ArtifactPublished { filename: String },

    /// The index already had this artifact; treated as success.
    ArtifactAlreadyExists { filename: String },
}

impl EventKind {
    /// The snake_case kind string used as `RunEvent::kind`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::CellStarted => "cell_started",
            EventKind::CellCompleted => "cell_completed",
            EventKind::CellFailed => "cell_failed",
            EventKind::StageStarted { .. } => "stage_started",
            EventKind::StageSucceeded { .. } => "stage_succeeded",
            EventKind::StageFailed { .. } => "stage_failed",
            EventKind::StageSkipped { .. } => "stage_skipped",
            EventKind::CoverageMeasured => "coverage_measured",
            EventKind::CoverageUploaded => "coverage_uploaded",
            EventKind::CoverageUploadFailed => "coverage_upload_failed",
            EventKind::PublishGateEvaluated => "publish_gate_evaluated",
            EventKind::ArtifactPublished { .. } => "artifact_published",
            EventKind::ArtifactAlreadyExists { .. } => "artifact_already_exists",
        }
    }

    /// Stage name carried by stage events.
    pub fn stage(&self) -> Option<&str> {
        match self {
            EventKind::StageStarted { stage }
            | EventKind::StageSucceeded { stage }
            | EventKind::StageFailed { stage }
            | EventKind::StageSkipped { stage } => Some(stage),
            _ => None,
        }
    }
}

/// A single event in a cell run's execution trace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Monotonically increasing sequence number within the run.
    pub seq: u64,

    /// When the event occurred.
    pub timestamp: DateTime<Utc>,

    /// Event classification.
    pub kind: EventKind,

    /// Event-specific payload.
    pub payload: serde_json::Value,
}

impl Event {
    /// Create a new event stamped with the current time.
    pub fn new(seq: u64, kind: EventKind, payload: serde_json::Value) -> Self {
        Self {
            seq,
            timestamp: Utc::now(),
            kind,
            payload,
        }
    }

    /// Ledger payload: the event payload merged with the kind's fields.
    pub fn ledger_payload(&self) -> serde_json::Value {
        let mut payload = match &self.payload {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".to_string(), other.clone());
                map
            }
        };
        if let Ok(serde_json::Value::Object(fields)) = serde_json::to_value(&self.kind) {
            for (key, value) in fields {
                if key != "type" {
                    payload.insert(key, value);
                }
            }
        }
        serde_json::Value::Object(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_str_matches_serde_tag() {
        let kinds = [
            EventKind::CellStarted,
            EventKind::StageFailed {
                stage: "pytest".to_string(),
            },
            EventKind::ArtifactAlreadyExists {
                filename: "weather-1.0.tar.gz".to_string(),
            },
            EventKind::CoverageUploadFailed,
        ];
        for kind in kinds {
            let value = serde_json::to_value(&kind).unwrap();
            assert_eq!(value["type"].as_str(), Some(kind.as_str()));
        }
    }

    #[test]
    fn stage_accessor() {
        let kind = EventKind::StageSkipped {
            stage: "publish".to_string(),
        };
        assert_eq!(kind.stage(), Some("publish"));
        assert_eq!(EventKind::CellStarted.stage(), None);
    }

    #[test]
    fn ledger_payload_merges_kind_fields() {
        let event = Event::new(
            3,
            EventKind::StageFailed {
                stage: "pytest".to_string(),
            },
            serde_json::json!({ "exit_code": 1, "fatal": true }),
        );
        let payload = event.ledger_payload();
        assert_eq!(payload["stage"], "pytest");
        assert_eq!(payload["exit_code"], 1);
        assert_eq!(payload["fatal"], true);
        assert!(payload.get("type").is_none());
    }
}
