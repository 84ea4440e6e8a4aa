//! Event store service.
//!
//! Appends run under the aggregate's write lock with optimistic retry; the
//! storage-layer uniqueness constraint remains the final arbiter for
//! conflicts across processes. Successful appends are handed to the broker
//! publish seam after the lock is released.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use control_plane_core::config::SnapshotConfig;
use control_plane_core::context::RequestContext;
use control_plane_core::error::{ControlPlaneError, Result};

use crate::db::events::{
    EventData, EventLogStore, EventRecord, ReplaySet, SnapshotRecord, SnapshotStore,
};
use crate::locks::AggregateLockManager;
use crate::monitoring::metrics;

use super::EventPublisher;

/// Coordinates the event log, snapshot store, per-aggregate locks, and the
/// broker publish seam.
pub struct EventStoreService {
    log: Arc<dyn EventLogStore>,
    snapshots: Arc<dyn SnapshotStore>,
    locks: Arc<AggregateLockManager>,
    publisher: Arc<dyn EventPublisher>,
    snapshot_config: SnapshotConfig,
}

impl EventStoreService {
    pub fn new(
        log: Arc<dyn EventLogStore>,
        snapshots: Arc<dyn SnapshotStore>,
        locks: Arc<AggregateLockManager>,
        publisher: Arc<dyn EventPublisher>,
        snapshot_config: SnapshotConfig,
    ) -> Self {
        Self {
            log,
            snapshots,
            locks,
            publisher,
            snapshot_config,
        }
    }

    /// Append one event with sequence validation.
    ///
    /// `expected_sequence` follows the 1-based convention: `0` (or `1`) for
    /// the first event of an aggregate, `current + 1` afterwards. `None`
    /// assigns the next sequence under the lock.
    pub async fn store_event(
        &self,
        ctx: &RequestContext,
        aggregate_id: &str,
        aggregate_type: &str,
        expected_sequence: Option<i64>,
        event_type: &str,
        payload: serde_json::Value,
        metadata: Option<serde_json::Value>,
    ) -> Result<EventRecord> {
        if aggregate_id.is_empty() {
            return Err(ControlPlaneError::validation("aggregate_id must not be empty"));
        }
        if event_type.is_empty() {
            return Err(ControlPlaneError::validation("event_type must not be empty"));
        }

        let log = self.log.clone();
        let aggregate_id_owned = aggregate_id.to_string();
        let aggregate_type_owned = aggregate_type.to_string();
        let event_type_owned = event_type.to_string();
        let metadata = metadata.unwrap_or_else(|| serde_json::json!({}));

        let record = self
            .locks
            .with_full(aggregate_id, move || {
                let log = log.clone();
                let aggregate_id = aggregate_id_owned.clone();
                let aggregate_type = aggregate_type_owned.clone();
                let event_type = event_type_owned.clone();
                let payload = payload.clone();
                let metadata = metadata.clone();
                async move {
                    let current = log.latest_sequence(&aggregate_id).await?;
                    let sequence = next_accepted_sequence(&aggregate_id, current, expected_sequence)?;

                    let record = EventRecord::new(
                        &aggregate_id,
                        &aggregate_type,
                        sequence,
                        &event_type,
                        payload,
                        metadata,
                    );
                    log.append(&record).await?;
                    Ok(record)
                }
            })
            .await
            .map_err(|error| {
                if matches!(error, ControlPlaneError::SequenceConflict { .. }) {
                    metrics::SEQUENCE_CONFLICTS.inc();
                }
                error
            })?;

        metrics::EVENTS_APPENDED.inc();
        debug!(
            aggregate_id,
            sequence = record.sequence_number,
            event_type,
            correlation_id = %ctx.correlation_id,
            "event stored"
        );

        self.publish(&record).await;
        Ok(record)
    }

    /// Append a batch atomically, with the same precondition applied to
    /// `starting_sequence`; stored sequences are consecutive from it.
    pub async fn store_events(
        &self,
        ctx: &RequestContext,
        aggregate_id: &str,
        aggregate_type: &str,
        starting_sequence: Option<i64>,
        events: Vec<EventData>,
    ) -> Result<Vec<EventRecord>> {
        if events.is_empty() {
            return Err(ControlPlaneError::validation("event batch must not be empty"));
        }
        if aggregate_id.is_empty() {
            return Err(ControlPlaneError::validation("aggregate_id must not be empty"));
        }

        let log = self.log.clone();
        let aggregate_id_owned = aggregate_id.to_string();
        let aggregate_type_owned = aggregate_type.to_string();
        let events = Arc::new(events);

        let records = self
            .locks
            .with_full(aggregate_id, move || {
                let log = log.clone();
                let aggregate_id = aggregate_id_owned.clone();
                let aggregate_type = aggregate_type_owned.clone();
                let events = events.clone();
                async move {
                    let current = log.latest_sequence(&aggregate_id).await?;
                    let first = next_accepted_sequence(&aggregate_id, current, starting_sequence)?;

                    let records: Vec<EventRecord> = events
                        .iter()
                        .enumerate()
                        .map(|(offset, data)| {
                            EventRecord::new(
                                &aggregate_id,
                                &aggregate_type,
                                first + offset as i64,
                                &data.event_type,
                                data.payload.clone(),
                                data.metadata.clone(),
                            )
                        })
                        .collect();

                    log.append_batch(&records).await?;
                    Ok(records)
                }
            })
            .await
            .map_err(|error| {
                if matches!(error, ControlPlaneError::SequenceConflict { .. }) {
                    metrics::SEQUENCE_CONFLICTS.inc();
                }
                error
            })?;

        metrics::EVENTS_APPENDED.inc_by(records.len() as u64);
        info!(
            aggregate_id,
            count = records.len(),
            first_sequence = records.first().map(|r| r.sequence_number).unwrap_or(0),
            correlation_id = %ctx.correlation_id,
            "event batch stored"
        );

        for record in &records {
            self.publish(record).await;
        }
        Ok(records)
    }

    /// Events of one aggregate in sequence order, under the read lock.
    pub async fn events_for_aggregate(
        &self,
        aggregate_id: &str,
        from: Option<i64>,
    ) -> Result<Vec<EventRecord>> {
        let log = self.log.clone();
        let aggregate_id_owned = aggregate_id.to_string();
        self.locks
            .with_read(aggregate_id, || async move {
                log.read_by_aggregate(&aggregate_id_owned, from).await
            })
            .await
    }

    /// Highest stored sequence, `0` for an unknown aggregate.
    pub async fn latest_sequence(&self, aggregate_id: &str) -> Result<i64> {
        self.log.latest_sequence(aggregate_id).await
    }

    /// The sequence the next event will receive: `current + 1`, so `1` for
    /// a new aggregate.
    pub async fn next_sequence(&self, aggregate_id: &str) -> Result<i64> {
        Ok(self.log.latest_sequence(aggregate_id).await? + 1)
    }

    pub async fn has_events(&self, aggregate_id: &str) -> Result<bool> {
        Ok(self.log.latest_sequence(aggregate_id).await? > 0)
    }

    pub async fn count_events(&self, aggregate_id: &str) -> Result<i64> {
        self.log.count_by_aggregate(aggregate_id).await
    }

    pub async fn events_by_aggregate_type(
        &self,
        aggregate_type: &str,
        from_ts: Option<DateTime<Utc>>,
        to_ts: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>> {
        self.log.read_by_aggregate_type(aggregate_type, from_ts, to_ts).await
    }

    pub async fn events_by_event_type(
        &self,
        event_type: &str,
        from_ts: Option<DateTime<Utc>>,
        to_ts: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>> {
        self.log.read_by_event_type(event_type, from_ts, to_ts).await
    }

    pub async fn events_after_timestamp(&self, ts: DateTime<Utc>) -> Result<Vec<EventRecord>> {
        self.log.read_after_timestamp(ts).await
    }

    /// Snapshot-accelerated replay: the snapshot (if any) plus events with
    /// sequences above it, read consistently under the read lock.
    pub async fn events_for_replay_with_snapshot(&self, aggregate_id: &str) -> Result<ReplaySet> {
        let log = self.log.clone();
        let snapshots = self.snapshots.clone();
        let aggregate_id_owned = aggregate_id.to_string();

        self.locks
            .with_read(aggregate_id, || async move {
                let snapshot = snapshots.get(&aggregate_id_owned).await?;
                let from = snapshot.as_ref().map(|s| s.sequence_number + 1);
                let events = log.read_by_aggregate(&aggregate_id_owned, from).await?;
                Ok(ReplaySet { snapshot, events })
            })
            .await
    }

    /// Whether a fresh snapshot is advised for the aggregate.
    pub async fn should_snapshot(&self, aggregate_id: &str) -> Result<bool> {
        let current = self.log.latest_sequence(aggregate_id).await?;
        if current == 0 {
            return Ok(false);
        }

        let threshold = self.snapshot_config.threshold;
        Ok(match self.snapshots.get(aggregate_id).await? {
            Some(snapshot) => current - snapshot.sequence_number >= threshold,
            None => current >= threshold,
        })
    }

    /// Upsert the aggregate's snapshot at the given sequence.
    pub async fn create_snapshot(
        &self,
        aggregate_id: &str,
        aggregate_type: &str,
        sequence: i64,
        state: serde_json::Value,
    ) -> Result<SnapshotRecord> {
        if sequence < 1 {
            return Err(ControlPlaneError::validation("snapshot sequence must be >= 1"));
        }
        let current = self.log.latest_sequence(aggregate_id).await?;
        if sequence > current {
            return Err(ControlPlaneError::validation(format!(
                "snapshot sequence {} is beyond latest event sequence {}",
                sequence, current
            )));
        }

        let snapshot = SnapshotRecord::new(aggregate_id, aggregate_type, sequence, state);
        self.snapshots.upsert(&snapshot).await?;
        info!(aggregate_id, sequence, "snapshot created");
        Ok(snapshot)
    }

    pub async fn snapshot_for(&self, aggregate_id: &str) -> Result<Option<SnapshotRecord>> {
        self.snapshots.get(aggregate_id).await
    }

    pub async fn delete_snapshot(&self, aggregate_id: &str) -> Result<()> {
        self.snapshots.delete(aggregate_id).await
    }

    pub async fn snapshots_by_type(&self, aggregate_type: &str) -> Result<Vec<SnapshotRecord>> {
        self.snapshots.list_by_type(aggregate_type).await
    }

    /// Delete snapshots past the retention cutoff; returns how many went.
    pub async fn cleanup_old_snapshots(&self) -> Result<usize> {
        let cutoff = Utc::now() - chrono::Duration::days(self.snapshot_config.retention_days);
        let deleted = self.snapshots.delete_older_than(cutoff).await?;
        if deleted > 0 {
            info!(deleted, "expired snapshots removed");
        }
        Ok(deleted)
    }

    /// Daily retention sweep. Errors are logged and swallowed; the task
    /// keeps running until shutdown.
    pub fn start_snapshot_cleanup(
        self: &Arc<Self>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
            interval.tick().await; // immediate first tick
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = service.cleanup_old_snapshots().await {
                            error!(error = %e, "snapshot cleanup failed");
                        }
                    }
                    _ = shutdown.recv() => {
                        info!("snapshot cleanup task stopping");
                        break;
                    }
                }
            }
        })
    }

    async fn publish(&self, record: &EventRecord) {
        if let Err(error) = self.publisher.publish(record).await {
            warn!(
                error = %error,
                event_id = %record.id,
                aggregate_id = %record.aggregate_id,
                "event publish failed"
            );
        }
    }
}

/// Apply the acceptance rule and return the sequence to store.
///
/// Accepted iff `(current == 0 && expected == 0)` or
/// `expected == current + 1`; `None` always assigns `current + 1`.
fn next_accepted_sequence(
    aggregate_id: &str,
    current: i64,
    expected: Option<i64>,
) -> Result<i64> {
    match expected {
        None => Ok(current + 1),
        Some(0) if current == 0 => Ok(1),
        Some(expected) if expected == current + 1 => Ok(expected),
        Some(expected) => Err(ControlPlaneError::SequenceConflict {
            aggregate_id: aggregate_id.to_string(),
            expected,
            current,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{InMemoryEventStore, InMemorySnapshotStore};
    use control_plane_core::error::RetryPolicy;
    use serde_json::json;

    fn service() -> EventStoreService {
        service_with(SnapshotConfig::default())
    }

    fn service_with(snapshot_config: SnapshotConfig) -> EventStoreService {
        EventStoreService::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemorySnapshotStore::new()),
            Arc::new(AggregateLockManager::new(RetryPolicy {
                jitter_factor: 0.0,
                ..RetryPolicy::default()
            })),
            Arc::new(crate::events::LoggingEventPublisher::new()),
            snapshot_config,
        )
    }

    #[test]
    fn test_sequence_acceptance_rule() {
        assert_eq!(next_accepted_sequence("a", 0, Some(0)).unwrap(), 1);
        assert_eq!(next_accepted_sequence("a", 0, Some(1)).unwrap(), 1);
        assert_eq!(next_accepted_sequence("a", 4, Some(5)).unwrap(), 5);
        assert_eq!(next_accepted_sequence("a", 4, None).unwrap(), 5);
        assert!(next_accepted_sequence("a", 4, Some(4)).is_err());
        assert!(next_accepted_sequence("a", 0, Some(2)).is_err());
    }

    #[tokio::test]
    async fn test_store_event_assigns_dense_sequences() {
        let service = service();
        let ctx = RequestContext::new();

        for expected in [Some(0), Some(2), Some(3)] {
            service
                .store_event(&ctx, "u-1", "User", expected, "Created", json!({}), None)
                .await
                .unwrap();
        }

        let events = service.events_for_aggregate("u-1", None).await.unwrap();
        let sequences: Vec<i64> = events.iter().map(|e| e.sequence_number).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(service.latest_sequence("u-1").await.unwrap(), 3);
        assert_eq!(service.next_sequence("u-1").await.unwrap(), 4);
        assert!(service.has_events("u-1").await.unwrap());
    }

    #[tokio::test]
    async fn test_stale_expected_sequence_conflicts() {
        let service = service();
        let ctx = RequestContext::new();

        service
            .store_event(&ctx, "u-1", "User", Some(0), "Created", json!({}), None)
            .await
            .unwrap();

        let result = service
            .store_event(&ctx, "u-1", "User", Some(1), "Renamed", json!({}), None)
            .await;
        assert!(matches!(
            result,
            Err(ControlPlaneError::SequenceConflict { current: 1, .. })
        ));
        assert_eq!(service.latest_sequence("u-1").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_store_events_batch_is_atomic_and_consecutive() {
        let service = service();
        let ctx = RequestContext::new();

        let batch = vec![
            EventData {
                event_type: "Created".to_string(),
                payload: json!({"n": 1}),
                metadata: json!({}),
            },
            EventData {
                event_type: "Renamed".to_string(),
                payload: json!({"n": 2}),
                metadata: json!({}),
            },
        ];

        let records = service
            .store_events(&ctx, "u-2", "User", Some(0), batch)
            .await
            .unwrap();
        assert_eq!(
            records.iter().map(|r| r.sequence_number).collect::<Vec<_>>(),
            vec![1, 2]
        );

        let result = service
            .store_events(
                &ctx,
                "u-2",
                "User",
                Some(1),
                vec![EventData {
                    event_type: "X".to_string(),
                    payload: json!({}),
                    metadata: json!({}),
                }],
            )
            .await;
        assert!(matches!(
            result,
            Err(ControlPlaneError::SequenceConflict { .. })
        ));
        assert_eq!(service.latest_sequence("u-2").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_empty_batch_is_rejected() {
        let service = service();
        let ctx = RequestContext::new();
        let result = service.store_events(&ctx, "u-3", "User", Some(0), vec![]).await;
        assert!(matches!(result, Err(ControlPlaneError::ValidationError { .. })));
    }

    #[tokio::test]
    async fn test_replay_with_snapshot_returns_tail_events() {
        let service = service();
        let ctx = RequestContext::new();

        for i in 1..=25 {
            service
                .store_event(&ctx, "u-9", "User", Some(i), "Tick", json!({"i": i}), None)
                .await
                .unwrap();
        }
        service
            .create_snapshot("u-9", "User", 20, json!({"count": 20}))
            .await
            .unwrap();

        let replay = service.events_for_replay_with_snapshot("u-9").await.unwrap();
        let snapshot = replay.snapshot.expect("snapshot present");
        assert_eq!(snapshot.sequence_number, 20);
        assert_eq!(
            replay.events.iter().map(|e| e.sequence_number).collect::<Vec<_>>(),
            vec![21, 22, 23, 24, 25]
        );
    }

    #[tokio::test]
    async fn test_replay_without_snapshot_returns_all_events() {
        let service = service();
        let ctx = RequestContext::new();
        for i in 1..=3 {
            service
                .store_event(&ctx, "u-4", "User", Some(i), "Tick", json!({}), None)
                .await
                .unwrap();
        }

        let replay = service.events_for_replay_with_snapshot("u-4").await.unwrap();
        assert!(replay.snapshot.is_none());
        assert_eq!(replay.events.len(), 3);
    }

    #[tokio::test]
    async fn test_should_snapshot_thresholds() {
        let service = service_with(SnapshotConfig {
            threshold: 5,
            ..SnapshotConfig::default()
        });
        let ctx = RequestContext::new();

        assert!(!service.should_snapshot("u-5").await.unwrap());

        for i in 1..=5 {
            service
                .store_event(&ctx, "u-5", "User", Some(i), "Tick", json!({}), None)
                .await
                .unwrap();
        }
        assert!(service.should_snapshot("u-5").await.unwrap());

        service
            .create_snapshot("u-5", "User", 5, json!({}))
            .await
            .unwrap();
        assert!(!service.should_snapshot("u-5").await.unwrap());
    }

    #[tokio::test]
    async fn test_snapshot_beyond_latest_sequence_is_rejected() {
        let service = service();
        let ctx = RequestContext::new();
        service
            .store_event(&ctx, "u-6", "User", Some(0), "Created", json!({}), None)
            .await
            .unwrap();

        let result = service.create_snapshot("u-6", "User", 2, json!({})).await;
        assert!(matches!(result, Err(ControlPlaneError::ValidationError { .. })));
    }

    #[tokio::test]
    async fn test_snapshot_upsert_replaces_prior() {
        let service = service();
        let ctx = RequestContext::new();
        for i in 1..=2 {
            service
                .store_event(&ctx, "u-7", "User", Some(i), "Tick", json!({}), None)
                .await
                .unwrap();
        }

        service.create_snapshot("u-7", "User", 1, json!({"v": 1})).await.unwrap();
        service.create_snapshot("u-7", "User", 2, json!({"v": 2})).await.unwrap();

        let snapshot = service.snapshot_for("u-7").await.unwrap().unwrap();
        assert_eq!(snapshot.sequence_number, 2);
        assert_eq!(snapshot.payload, json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_storage_outage_is_not_retried() {
        let mut log = crate::db::events::store::MockEventLogStore::new();
        log.expect_latest_sequence()
            .times(1)
            .returning(|_| Err(ControlPlaneError::storage("db down")));

        let service = EventStoreService::new(
            Arc::new(log),
            Arc::new(InMemorySnapshotStore::new()),
            Arc::new(AggregateLockManager::default()),
            Arc::new(crate::events::LoggingEventPublisher::new()),
            SnapshotConfig::default(),
        );

        let ctx = RequestContext::new();
        let result = service
            .store_event(&ctx, "u-1", "User", Some(0), "Created", json!({}), None)
            .await;
        assert!(matches!(
            result,
            Err(ControlPlaneError::StorageUnavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_publish_failure_does_not_fail_append() {
        let mut publisher = crate::events::publisher::MockEventPublisher::new();
        publisher
            .expect_publish()
            .times(1)
            .returning(|_| Err(ControlPlaneError::storage("broker down")));

        let service = EventStoreService::new(
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemorySnapshotStore::new()),
            Arc::new(AggregateLockManager::default()),
            Arc::new(publisher),
            SnapshotConfig::default(),
        );

        let ctx = RequestContext::new();
        let record = service
            .store_event(&ctx, "u-1", "User", Some(0), "Created", json!({}), None)
            .await
            .unwrap();
        assert_eq!(record.sequence_number, 1);
    }

    #[tokio::test]
    async fn test_concurrent_appends_same_expected_yield_one_winner() {
        let service = Arc::new(service());

        let mut handles = Vec::new();
        for _ in 0..2 {
            let service = service.clone();
            handles.push(tokio::spawn(async move {
                let ctx = RequestContext::new();
                service
                    .store_event(&ctx, "u-7c", "User", Some(1), "Created", json!({}), None)
                    .await
            }));
        }

        let mut oks = 0;
        let mut conflicts = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(record) => {
                    assert_eq!(record.sequence_number, 1);
                    oks += 1;
                }
                Err(ControlPlaneError::SequenceConflict { .. }) => conflicts += 1,
                Err(other) => panic!("unexpected error: {}", other),
            }
        }

        assert_eq!(oks, 1);
        assert_eq!(conflicts, 1);
        assert_eq!(service.latest_sequence("u-7c").await.unwrap(), 1);
    }
}
