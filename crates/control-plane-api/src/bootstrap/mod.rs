//! Server aggregate: explicit construction and ordered shutdown.
//!
//! Components are plain values owned here; nothing is container-managed.
//! Shutdown stops the streaming health and cleanup tasks first, drains
//! subscribers, and lets services and stores drop last.

use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use control_plane_core::config::ControlPlaneConfig;
use control_plane_core::error::Result;

use crate::api::AppState;
use crate::cleanup::CleanupScheduler;
use crate::db;
use crate::db::events::{EventLogStore, PostgresEventStore, PostgresSnapshotStore, SnapshotStore};
use crate::events::{EventPublisher, EventStoreService, LoggingEventPublisher};
use crate::health::StreamingHealthService;
use crate::locks::AggregateLockManager;
use crate::monitoring::metrics;
use crate::registry::{HandlerRegistry, InMemoryRegistryStore, RedisRegistryStore, RegistryStore};
use crate::testing::{InMemoryEventStore, InMemorySnapshotStore};

/// The assembled control plane.
pub struct ControlPlaneServer {
    pub config: ControlPlaneConfig,
    pub registry: Arc<HandlerRegistry>,
    pub events: Arc<EventStoreService>,
    pub health: Arc<StreamingHealthService>,
    pub cleanup: Arc<CleanupScheduler>,
    pub locks: Arc<AggregateLockManager>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ControlPlaneServer {
    /// Wire the production backends: redis for the registry, postgres for
    /// the event log and snapshots.
    pub async fn build(config: ControlPlaneConfig) -> Result<Self> {
        let registry_store: Arc<dyn RegistryStore> =
            Arc::new(RedisRegistryStore::connect(&config.registry.redis_url).await?);

        let pool = Arc::new(db::init_pool(
            &config.event_store.database_url,
            config.event_store.connection_pool_size,
        )?);
        let log: Arc<dyn EventLogStore> = Arc::new(PostgresEventStore::new(pool.clone()));
        let snapshots: Arc<dyn SnapshotStore> = Arc::new(PostgresSnapshotStore::new(pool));

        Ok(Self::assemble(
            config,
            registry_store,
            log,
            snapshots,
            Arc::new(LoggingEventPublisher::new()),
        ))
    }

    /// Everything in process memory; used by tests and local development.
    pub fn build_in_memory(config: ControlPlaneConfig) -> Self {
        Self::assemble(
            config,
            Arc::new(InMemoryRegistryStore::new()),
            Arc::new(InMemoryEventStore::new()),
            Arc::new(InMemorySnapshotStore::new()),
            Arc::new(LoggingEventPublisher::new()),
        )
    }

    /// Compose the server from explicit collaborators.
    pub fn assemble(
        config: ControlPlaneConfig,
        registry_store: Arc<dyn RegistryStore>,
        log: Arc<dyn EventLogStore>,
        snapshots: Arc<dyn SnapshotStore>,
        publisher: Arc<dyn EventPublisher>,
    ) -> Self {
        metrics::init();

        let locks = Arc::new(AggregateLockManager::new(config.lock_retry.to_policy()));
        let registry = Arc::new(HandlerRegistry::new(
            registry_store.clone(),
            config.registry.clone(),
        ));
        let health = Arc::new(StreamingHealthService::new(
            registry_store.clone(),
            config.registry.clone(),
        ));
        let events = Arc::new(EventStoreService::new(
            log,
            snapshots,
            locks.clone(),
            publisher,
            config.snapshot.clone(),
        ));
        let cleanup = Arc::new(CleanupScheduler::new(
            registry.clone(),
            registry_store,
            config.registry.clone(),
        ));

        let (shutdown, _) = broadcast::channel(1);

        Self {
            config,
            registry,
            events,
            health,
            cleanup,
            locks,
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the periodic tasks: staleness/cleanup fan-out, registry
    /// sweeps, and (when enabled) the daily snapshot retention pass.
    pub async fn start(&self) {
        let mut tasks = self.tasks.lock().await;

        tasks.extend(self.health.start(&self.shutdown));
        tasks.extend(self.cleanup.start(&self.shutdown));
        if self.config.snapshot.cleanup_enabled {
            tasks.push(self.events.start_snapshot_cleanup(self.shutdown.subscribe()));
        }

        info!(tasks = tasks.len(), "background tasks started");
    }

    /// Handler state for the HTTP layer.
    pub fn app_state(&self) -> actix_web::web::Data<AppState> {
        actix_web::web::Data::new(AppState {
            registry: self.registry.clone(),
            events: self.events.clone(),
            health: self.health.clone(),
        })
    }

    /// Stop background tasks, then drain stream subscribers. Services and
    /// stores drop with the server value afterwards.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            let _ = task.await;
        }

        self.health.drain_subscribers().await;
        info!("control plane stopped");
    }
}
