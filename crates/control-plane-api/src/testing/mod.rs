//! In-memory store implementations for tests and single-node development.
//!
//! The in-memory event log enforces the same `(aggregate_id,
//! sequence_number)` uniqueness invariant as the postgres backend, so
//! service-level behavior (including conflict translation) is identical.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use control_plane_core::config::{RegistryConfig, SnapshotConfig};
use control_plane_core::error::{ControlPlaneError, Result};

use crate::api::AppState;
use crate::db::events::{EventLogStore, EventRecord, SnapshotRecord, SnapshotStore};
use crate::events::{EventStoreService, LoggingEventPublisher};
use crate::health::StreamingHealthService;
use crate::locks::AggregateLockManager;
use crate::registry::{HandlerRegistry, InMemoryRegistryStore};

/// Fully wired application state over in-memory backends.
pub fn in_memory_app_state() -> actix_web::web::Data<AppState> {
    let store = Arc::new(InMemoryRegistryStore::new());
    let registry = Arc::new(HandlerRegistry::new(
        store.clone(),
        RegistryConfig::default(),
    ));
    let health = Arc::new(StreamingHealthService::new(
        store,
        RegistryConfig::default(),
    ));
    let events = Arc::new(EventStoreService::new(
        Arc::new(InMemoryEventStore::new()),
        Arc::new(InMemorySnapshotStore::new()),
        Arc::new(AggregateLockManager::default()),
        Arc::new(LoggingEventPublisher::new()),
        SnapshotConfig::default(),
    ));
    actix_web::web::Data::new(AppState {
        registry,
        events,
        health,
    })
}

/// Append-only in-memory event log.
#[derive(Default)]
pub struct InMemoryEventStore {
    state: RwLock<LogState>,
}

#[derive(Default)]
struct LogState {
    events: Vec<EventRecord>,
    keys: HashSet<(String, i64)>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventLogStore for InMemoryEventStore {
    async fn append(&self, record: &EventRecord) -> Result<()> {
        let mut state = self.state.write().await;
        let key = (record.aggregate_id.clone(), record.sequence_number);
        if state.keys.contains(&key) {
            let current = state
                .events
                .iter()
                .filter(|e| e.aggregate_id == record.aggregate_id)
                .map(|e| e.sequence_number)
                .max()
                .unwrap_or(0);
            return Err(ControlPlaneError::SequenceConflict {
                aggregate_id: record.aggregate_id.clone(),
                expected: record.sequence_number,
                current,
            });
        }
        state.keys.insert(key);
        state.events.push(record.clone());
        Ok(())
    }

    async fn append_batch(&self, records: &[EventRecord]) -> Result<()> {
        let mut state = self.state.write().await;

        // All-or-nothing: validate the whole batch before touching state.
        let mut incoming = HashSet::new();
        for record in records {
            let key = (record.aggregate_id.clone(), record.sequence_number);
            if state.keys.contains(&key) || !incoming.insert(key) {
                let current = state
                    .events
                    .iter()
                    .filter(|e| e.aggregate_id == record.aggregate_id)
                    .map(|e| e.sequence_number)
                    .max()
                    .unwrap_or(0);
                return Err(ControlPlaneError::SequenceConflict {
                    aggregate_id: record.aggregate_id.clone(),
                    expected: record.sequence_number,
                    current,
                });
            }
        }

        for record in records {
            state
                .keys
                .insert((record.aggregate_id.clone(), record.sequence_number));
            state.events.push(record.clone());
        }
        Ok(())
    }

    async fn latest_sequence(&self, aggregate_id: &str) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .map(|e| e.sequence_number)
            .max()
            .unwrap_or(0))
    }

    async fn read_by_aggregate(
        &self,
        aggregate_id: &str,
        from_sequence: Option<i64>,
    ) -> Result<Vec<EventRecord>> {
        let state = self.state.read().await;
        let mut events: Vec<EventRecord> = state
            .events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .filter(|e| from_sequence.map(|from| e.sequence_number >= from).unwrap_or(true))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.sequence_number);
        Ok(events)
    }

    async fn read_by_aggregate_type(
        &self,
        aggregate_type: &str,
        from_ts: Option<DateTime<Utc>>,
        to_ts: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>> {
        let state = self.state.read().await;
        let mut events: Vec<EventRecord> = state
            .events
            .iter()
            .filter(|e| e.aggregate_type == aggregate_type)
            .filter(|e| in_range(e.recorded_at, from_ts, to_ts))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.recorded_at);
        Ok(events)
    }

    async fn read_by_event_type(
        &self,
        event_type: &str,
        from_ts: Option<DateTime<Utc>>,
        to_ts: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>> {
        let state = self.state.read().await;
        let mut events: Vec<EventRecord> = state
            .events
            .iter()
            .filter(|e| e.event_type == event_type)
            .filter(|e| in_range(e.recorded_at, from_ts, to_ts))
            .cloned()
            .collect();
        events.sort_by_key(|e| e.recorded_at);
        Ok(events)
    }

    async fn read_after_timestamp(&self, ts: DateTime<Utc>) -> Result<Vec<EventRecord>> {
        let state = self.state.read().await;
        let mut events: Vec<EventRecord> = state
            .events
            .iter()
            .filter(|e| e.recorded_at > ts)
            .cloned()
            .collect();
        events.sort_by_key(|e| e.recorded_at);
        Ok(events)
    }

    async fn count_by_aggregate(&self, aggregate_id: &str) -> Result<i64> {
        let state = self.state.read().await;
        Ok(state
            .events
            .iter()
            .filter(|e| e.aggregate_id == aggregate_id)
            .count() as i64)
    }
}

fn in_range(ts: DateTime<Utc>, from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> bool {
    from.map(|f| ts >= f).unwrap_or(true) && to.map(|t| ts <= t).unwrap_or(true)
}

/// In-memory snapshot store: one record per aggregate.
#[derive(Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<HashMap<String, SnapshotRecord>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn upsert(&self, snapshot: &SnapshotRecord) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(snapshot.aggregate_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn get(&self, aggregate_id: &str) -> Result<Option<SnapshotRecord>> {
        let snapshots = self.snapshots.read().await;
        Ok(snapshots.get(aggregate_id).cloned())
    }

    async fn delete(&self, aggregate_id: &str) -> Result<()> {
        let mut snapshots = self.snapshots.write().await;
        snapshots.remove(aggregate_id);
        Ok(())
    }

    async fn list_by_type(&self, aggregate_type: &str) -> Result<Vec<SnapshotRecord>> {
        let snapshots = self.snapshots.read().await;
        let mut matching: Vec<SnapshotRecord> = snapshots
            .values()
            .filter(|s| s.aggregate_type == aggregate_type)
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.aggregate_id.cmp(&b.aggregate_id));
        Ok(matching)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut snapshots = self.snapshots.write().await;
        let before = snapshots.len();
        snapshots.retain(|_, s| s.recorded_at >= cutoff);
        Ok(before - snapshots.len())
    }
}
