//! SurrealDB row types for the run ledger
//!
//! These mirror the `runs` and `run_events` tables defined in
//! `migrations`. They are converted to `storage_traits` types at the
//! ledger boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Serialize chrono DateTime as a SurrealDB datetime
mod surreal_datetime {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let sd = SurrealDatetime::from(*date);
        serde::Serialize::serialize(&sd, serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = SurrealDatetime::deserialize(deserializer)?;
        Ok(DateTime::from(sd))
    }
}

/// Serialize an optional chrono DateTime as a SurrealDB datetime
mod surreal_datetime_opt {
    use chrono::{DateTime, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};
    use surrealdb::sql::Datetime as SurrealDatetime;

    pub fn serialize<S>(date: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match date {
            Some(d) => {
                let sd = SurrealDatetime::from(*d);
                serde::Serialize::serialize(&Some(sd), serializer)
            }
            None => serde::Serialize::serialize(&None::<SurrealDatetime>, serializer),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let sd = Option::<SurrealDatetime>::deserialize(deserializer)?;
        Ok(sd.map(DateTime::from))
    }
}

/// Run row - one executed matrix cell
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    /// Unique run ID (UUID string)
    pub run_id: String,
    /// Cell spec digest (SHA256)
    pub spec_digest: String,
    /// Git SHA the cell was built from
    pub git_sha: Option<String>,
    /// Run label
    pub label: String,
    /// Arbitrary tags (JSON)
    pub tags: serde_json::Value,
    /// "running" | "completed" | "failed" | "cancelled"
    pub status: String,
    /// Total events recorded
    pub total_events: u64,
    /// Duration in milliseconds
    pub duration_ms: u64,
    /// Whether every fatal stage passed
    pub success: bool,
    #[serde(with = "surreal_datetime")]
    pub created_at: DateTime<Utc>,
    #[serde(default, with = "surreal_datetime_opt")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRow {
    /// Create a new row in "running" state
    pub fn new(
        run_id: String,
        spec_digest: String,
        git_sha: Option<String>,
        label: String,
        tags: serde_json::Value,
    ) -> Self {
        RunRow {
            id: None,
            run_id,
            spec_digest,
            git_sha,
            label,
            tags,
            status: "running".to_string(),
            total_events: 0,
            duration_ms: 0,
            success: false,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Run event row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEventRow {
    /// SurrealDB record ID
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<surrealdb::sql::Thing>,
    /// Run ID this event belongs to
    pub run_id: String,
    /// Monotonic sequence number within run (1-indexed)
    pub seq: u64,
    /// Event kind
    pub kind: String,
    /// Event payload (JSON)
    pub payload: serde_json::Value,
    #[serde(with = "surreal_datetime")]
    pub timestamp: DateTime<Utc>,
}

impl RunEventRow {
    pub fn new(
        run_id: String,
        seq: u64,
        kind: String,
        payload: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        RunEventRow {
            id: None,
            run_id,
            seq,
            kind,
            payload,
            timestamp,
        }
    }
}
