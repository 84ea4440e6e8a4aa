//! Event-sourcing storage types and store traits.
//!
//! The event log is append-only and keyed by `(aggregate_id,
//! sequence_number)`; sequence numbers for one aggregate are dense and
//! 1-based. Snapshots carry at most one materialized state per aggregate.

pub mod snapshots;
pub mod store;

pub use snapshots::{PostgresSnapshotStore, SnapshotStore};
pub use store::{EventLogStore, PostgresEventStore};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One immutable domain event as stored in the log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: Uuid,
    pub aggregate_id: String,
    pub aggregate_type: String,
    /// 1-based, dense per aggregate.
    pub sequence_number: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub metadata: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl EventRecord {
    /// Record ready for appending at the given sequence.
    pub fn new(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        sequence_number: i64,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        metadata: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            sequence_number,
            event_type: event_type.into(),
            payload,
            metadata,
            recorded_at: Utc::now(),
        }
    }
}

/// Payload of a not-yet-sequenced event inside a batch submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventData {
    pub event_type: String,
    pub payload: serde_json::Value,
    #[serde(default = "default_metadata")]
    pub metadata: serde_json::Value,
}

fn default_metadata() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

/// Materialized aggregate state at a given sequence; at most one per
/// aggregate, replaced on every upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub sequence_number: i64,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

impl SnapshotRecord {
    pub fn new(
        aggregate_id: impl Into<String>,
        aggregate_type: impl Into<String>,
        sequence_number: i64,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            aggregate_id: aggregate_id.into(),
            aggregate_type: aggregate_type.into(),
            sequence_number,
            payload,
            recorded_at: Utc::now(),
        }
    }
}

/// Snapshot-accelerated replay set: the snapshot (if any) plus every event
/// with a sequence above it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplaySet {
    pub snapshot: Option<SnapshotRecord>,
    pub events: Vec<EventRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_record_serde_round_trip() {
        let record = EventRecord::new(
            "u-7",
            "User",
            1,
            "UserCreatedEvent",
            json!({"name": "ada"}),
            json!({}),
        );
        let encoded = serde_json::to_string(&record).unwrap();
        let decoded: EventRecord = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_event_data_defaults_empty_metadata() {
        let data: EventData =
            serde_json::from_value(json!({"event_type": "Created", "payload": {"x": 1}})).unwrap();
        assert_eq!(data.metadata, json!({}));
    }
}
