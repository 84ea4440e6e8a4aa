//! Streaming health service.
//!
//! Ingests per-instance heartbeats, keeps the TTL-bound health records in
//! the registry store current, and fans every change out to stream
//! subscribers. Each subscriber owns a bounded mailbox; a full or closed
//! mailbox unsubscribes it, so one stalled consumer never blocks the rest.
//!
//! Two periodic tasks watch `last_seen`: a staleness pass broadcasts
//! `UNHEALTHY` for instances quiet for over a minute, and a cleanup pass
//! marks and forgets instances quiet past the health TTL.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use control_plane_core::config::RegistryConfig;
use control_plane_core::error::Result;
use control_plane_core::instance::{HealthChange, HealthRecord, InstanceStatus};

use crate::monitoring::metrics;
use crate::registry::{health_key, instance_key, RegistryStore};

/// Mailbox capacity per subscriber; overflow unsubscribes.
const MAILBOX_CAPACITY: usize = 64;

/// How often the staleness pass runs.
const STALENESS_INTERVAL: Duration = Duration::from_secs(30);

/// Quiet period after which an instance is broadcast as unhealthy.
const STALE_AFTER: Duration = Duration::from_secs(60);

/// How often the cleanup pass runs.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// One attached health-stream consumer.
struct SubscriberHandle {
    sender: mpsc::Sender<HealthChange>,
    registered_at: DateTime<Utc>,
}

/// Heartbeat ingestion and subscriber fan-out.
pub struct StreamingHealthService {
    store: Arc<dyn RegistryStore>,
    config: RegistryConfig,
    subscribers: RwLock<HashMap<String, SubscriberHandle>>,
    last_seen: RwLock<HashMap<String, Instant>>,
    /// Serializes broadcasts so every subscriber observes the same order.
    broadcast_guard: Mutex<()>,
}

impl StreamingHealthService {
    pub fn new(store: Arc<dyn RegistryStore>, config: RegistryConfig) -> Self {
        Self {
            store,
            config,
            subscribers: RwLock::new(HashMap::new()),
            last_seen: RwLock::new(HashMap::new()),
            broadcast_guard: Mutex::new(()),
        }
    }

    /// Ingest a heartbeat: refresh the TTL-bound health record, remember
    /// the instance as seen, and broadcast the change.
    pub async fn update_instance_health(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        metadata: HashMap<String, String>,
    ) -> Result<()> {
        let now_ms = Utc::now().timestamp_millis();

        let mut fields = HashMap::new();
        fields.insert("status".to_string(), status.as_str().to_string());
        fields.insert("last_heartbeat".to_string(), now_ms.to_string());
        if !metadata.is_empty() {
            fields.insert("extra".to_string(), serde_json::to_string(&metadata)?);
        }

        let key = health_key(instance_id);
        self.store.hash_put_all(&key, &fields).await?;
        self.store.expire(&key, self.config.health_ttl()).await?;
        // A live worker keeps its record discoverable; expire() is a no-op
        // once the record is gone.
        self.store
            .expire(&instance_key(instance_id), self.config.health_ttl())
            .await?;

        self.last_seen
            .write()
            .await
            .insert(instance_id.to_string(), Instant::now());

        metrics::HEARTBEATS.inc();
        debug!(instance_id, status = %status, "heartbeat ingested");

        let change = HealthChange {
            instance_id: instance_id.to_string(),
            status,
            timestamp_ms: now_ms,
            metadata,
        };
        self.broadcast(change).await;

        Ok(())
    }

    /// Heartbeat interval returned to workers.
    pub fn heartbeat_interval_seconds(&self) -> u64 {
        self.config.heartbeat_interval_seconds
    }

    /// Attach a subscriber and return its mailbox. The current health
    /// record for the subscriber's own id (if any) is delivered first so
    /// the consumer starts from known state.
    pub async fn register_subscriber(&self, subscriber_id: &str) -> mpsc::Receiver<HealthChange> {
        let (sender, receiver) = mpsc::channel(MAILBOX_CAPACITY);

        if let Some(snapshot) = self.existing_health_snapshot(subscriber_id).await {
            // Fresh channel; capacity cannot be exhausted yet.
            let _ = sender.try_send(snapshot);
        }

        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(
            subscriber_id.to_string(),
            SubscriberHandle {
                sender,
                registered_at: Utc::now(),
            },
        );
        metrics::ACTIVE_SUBSCRIBERS.set(subscribers.len() as i64);
        info!(subscriber_id, "health stream subscriber registered");

        receiver
    }

    /// Detach a subscriber; its stream ends when the sender drops.
    pub async fn unregister_subscriber(&self, subscriber_id: &str) {
        let mut subscribers = self.subscribers.write().await;
        if subscribers.remove(subscriber_id).is_some() {
            metrics::ACTIVE_SUBSCRIBERS.set(subscribers.len() as i64);
            info!(subscriber_id, "health stream subscriber unregistered");
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Deliver a change to every subscriber, dropping the ones whose
    /// mailbox is full or closed. Send failures never reach the sender of
    /// the heartbeat.
    pub async fn broadcast(&self, change: HealthChange) {
        let _ordering = self.broadcast_guard.lock().await;
        let mut subscribers = self.subscribers.write().await;

        let mut failed: Vec<String> = Vec::new();
        for (subscriber_id, handle) in subscribers.iter() {
            if let Err(error) = handle.sender.try_send(change.clone()) {
                warn!(
                    subscriber_id = %subscriber_id,
                    error = %error,
                    registered_at = %handle.registered_at,
                    "subscriber send failed, unsubscribing"
                );
                failed.push(subscriber_id.clone());
            }
        }

        for subscriber_id in failed {
            subscribers.remove(&subscriber_id);
        }

        metrics::ACTIVE_SUBSCRIBERS.set(subscribers.len() as i64);
        metrics::HEALTH_CHANGES_BROADCAST.inc();
    }

    /// Broadcast `UNHEALTHY` for every instance quiet for over a minute.
    pub async fn run_staleness_check_once(&self) {
        let stale: Vec<String> = {
            let last_seen = self.last_seen.read().await;
            last_seen
                .iter()
                .filter(|(_, seen)| seen.elapsed() > STALE_AFTER)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for instance_id in stale {
            debug!(instance_id = %instance_id, "instance stale, broadcasting unhealthy");
            self.broadcast(HealthChange::new(&instance_id, InstanceStatus::Unhealthy)).await;
        }
    }

    /// Mark instances quiet past the health TTL as unhealthy, broadcast,
    /// and forget them. Store errors are logged and swallowed.
    pub async fn run_cleanup_once(&self) {
        let expire_after = self.config.health_ttl();
        let expired: Vec<String> = {
            let last_seen = self.last_seen.read().await;
            last_seen
                .iter()
                .filter(|(_, seen)| seen.elapsed() > expire_after)
                .map(|(id, _)| id.clone())
                .collect()
        };

        for instance_id in &expired {
            let mut fields = HashMap::new();
            fields.insert(
                "status".to_string(),
                InstanceStatus::Unhealthy.as_str().to_string(),
            );
            let key = health_key(instance_id);
            if let Err(error) = self.store.hash_put_all(&key, &fields).await {
                warn!(error = %error, instance_id = %instance_id, "failed to mark instance unhealthy");
            } else if let Err(error) = self.store.expire(&key, expire_after).await {
                warn!(error = %error, instance_id = %instance_id, "failed to refresh health ttl");
            }

            self.broadcast(HealthChange::new(instance_id, InstanceStatus::Unhealthy)).await;
        }

        if !expired.is_empty() {
            let mut last_seen = self.last_seen.write().await;
            for instance_id in &expired {
                last_seen.remove(instance_id);
            }
            info!(expired = expired.len(), "quiet instances forgotten");
        }
    }

    /// Spawn the staleness and cleanup tasks; both stop on shutdown.
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let service = self.clone();
        let mut stop = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(STALENESS_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => service.run_staleness_check_once().await,
                    _ = stop.recv() => {
                        info!("staleness task stopping");
                        break;
                    }
                }
            }
        }));

        let service = self.clone();
        let mut stop = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => service.run_cleanup_once().await,
                    _ = stop.recv() => {
                        info!("health cleanup task stopping");
                        break;
                    }
                }
            }
        }));

        handles
    }

    /// Drop every subscriber, ending their streams.
    pub async fn drain_subscribers(&self) {
        let mut subscribers = self.subscribers.write().await;
        let drained = subscribers.len();
        subscribers.clear();
        metrics::ACTIVE_SUBSCRIBERS.set(0);
        if drained > 0 {
            info!(drained, "health stream subscribers drained");
        }
    }

    /// Current health record of an instance, if its hash is still present.
    pub async fn current_health(&self, instance_id: &str) -> Option<HealthRecord> {
        let fields = match self.store.hash_get_all(&health_key(instance_id)).await {
            Ok(fields) => fields,
            Err(error) => {
                warn!(error = %error, instance_id, "health read failed");
                return None;
            }
        };
        if fields.is_empty() {
            return None;
        }

        let status = fields.get("status").and_then(|raw| InstanceStatus::parse(raw))?;
        let last_heartbeat = fields
            .get("last_heartbeat")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or_else(|| Utc::now().timestamp_millis());

        let mut record = HealthRecord::new(instance_id, status);
        record.last_heartbeat = last_heartbeat;
        record.extra = fields
            .get("extra")
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        Some(record)
    }

    async fn existing_health_snapshot(&self, subscriber_id: &str) -> Option<HealthChange> {
        let record = self.current_health(subscriber_id).await?;

        let mut metadata = HashMap::new();
        metadata.insert("source".to_string(), "existing_health_data".to_string());

        Some(HealthChange {
            instance_id: record.instance_id,
            status: record.status,
            timestamp_ms: record.last_heartbeat,
            metadata,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InMemoryRegistryStore;

    fn service() -> Arc<StreamingHealthService> {
        Arc::new(StreamingHealthService::new(
            Arc::new(InMemoryRegistryStore::new()),
            RegistryConfig::default(),
        ))
    }

    #[tokio::test]
    async fn test_heartbeat_reaches_subscriber() {
        let service = service();
        let mut stream = service.register_subscriber("monitor-1").await;

        service
            .update_instance_health("w-X", InstanceStatus::Healthy, HashMap::new())
            .await
            .unwrap();

        let change = stream.recv().await.unwrap();
        assert_eq!(change.instance_id, "w-X");
        assert_eq!(change.status, InstanceStatus::Healthy);
    }

    #[tokio::test]
    async fn test_subscriber_primed_with_existing_health() {
        let service = service();
        service
            .update_instance_health("w-X", InstanceStatus::Healthy, HashMap::new())
            .await
            .unwrap();

        let mut stream = service.register_subscriber("w-X").await;
        let snapshot = stream.recv().await.unwrap();
        assert_eq!(snapshot.instance_id, "w-X");
        assert_eq!(snapshot.status, InstanceStatus::Healthy);
        assert_eq!(
            snapshot.metadata.get("source").map(String::as_str),
            Some("existing_health_data")
        );
    }

    #[tokio::test]
    async fn test_current_health_round_trips_extra_metadata() {
        let service = service();
        let mut metadata = HashMap::new();
        metadata.insert("zone".to_string(), "eu-1".to_string());

        service
            .update_instance_health("w-X", InstanceStatus::Healthy, metadata)
            .await
            .unwrap();

        let record = service.current_health("w-X").await.unwrap();
        assert_eq!(record.instance_id, "w-X");
        assert_eq!(record.status, InstanceStatus::Healthy);
        assert_eq!(record.extra.get("zone").map(String::as_str), Some("eu-1"));
    }

    #[tokio::test]
    async fn test_changes_arrive_in_broadcast_order() {
        let service = service();
        let mut stream = service.register_subscriber("monitor-1").await;

        for status in [
            InstanceStatus::Healthy,
            InstanceStatus::Unhealthy,
            InstanceStatus::Healthy,
        ] {
            service
                .update_instance_health("w-X", status, HashMap::new())
                .await
                .unwrap();
        }

        let statuses: Vec<InstanceStatus> = vec![
            stream.recv().await.unwrap().status,
            stream.recv().await.unwrap().status,
            stream.recv().await.unwrap().status,
        ];
        assert_eq!(
            statuses,
            vec![
                InstanceStatus::Healthy,
                InstanceStatus::Unhealthy,
                InstanceStatus::Healthy
            ]
        );
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_removed() {
        let service = service();
        let stream = service.register_subscriber("monitor-1").await;
        assert_eq!(service.subscriber_count().await, 1);

        drop(stream);
        service
            .update_instance_health("w-X", InstanceStatus::Healthy, HashMap::new())
            .await
            .unwrap();

        assert_eq!(service.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_full_mailbox_unsubscribes() {
        let service = service();
        let _stream = service.register_subscriber("slow-monitor").await;

        // Never drained: overflows after MAILBOX_CAPACITY sends.
        for _ in 0..(MAILBOX_CAPACITY + 1) {
            service.broadcast(HealthChange::new("w-X", InstanceStatus::Healthy)).await;
        }

        assert_eq!(service.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_one_failed_subscriber_does_not_affect_others() {
        let service = service();
        let dead = service.register_subscriber("dead").await;
        let mut live = service.register_subscriber("live").await;
        drop(dead);

        service
            .update_instance_health("w-X", InstanceStatus::Healthy, HashMap::new())
            .await
            .unwrap();

        assert_eq!(live.recv().await.unwrap().instance_id, "w-X");
        assert_eq!(service.subscriber_count().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_staleness_pass_broadcasts_unhealthy() {
        let service = service();
        service
            .update_instance_health("w-X", InstanceStatus::Healthy, HashMap::new())
            .await
            .unwrap();

        let mut stream = service.register_subscriber("monitor-1").await;

        tokio::time::advance(Duration::from_secs(65)).await;
        service.run_staleness_check_once().await;

        let change = stream.recv().await.unwrap();
        assert_eq!(change.instance_id, "w-X");
        assert_eq!(change.status, InstanceStatus::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_pass_marks_and_forgets() {
        let store = Arc::new(InMemoryRegistryStore::new());
        let service = Arc::new(StreamingHealthService::new(
            store.clone(),
            RegistryConfig::default(),
        ));
        service
            .update_instance_health("w-X", InstanceStatus::Healthy, HashMap::new())
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(125)).await;
        service.run_cleanup_once().await;

        let status = store.hash_get(&health_key("w-X"), "status").await.unwrap();
        assert_eq!(status, Some("UNHEALTHY".to_string()));

        // Forgotten: a second pass has nothing left to broadcast.
        let mut stream = service.register_subscriber("monitor-1").await;
        // Drain the priming snapshot for our own id, if any.
        while let Ok(change) = stream.try_recv() {
            assert_eq!(change.metadata.get("source").map(String::as_str), Some("existing_health_data"));
        }
        service.run_cleanup_once().await;
        assert!(stream.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unregister_subscriber_ends_stream() {
        let service = service();
        let mut stream = service.register_subscriber("monitor-1").await;
        service.unregister_subscriber("monitor-1").await;

        assert!(stream.recv().await.is_none());
        assert_eq!(service.subscriber_count().await, 0);
    }
}
