//! Cleanup scheduler.
//!
//! Two periodic sweeps keep the routing table honest even when the backing
//! store cannot evict on its own: an instance sweep removes workers whose
//! last heartbeat is past the health TTL, and a reconcile pass drops
//! instance ids from `route:*` sets that no longer have an `instance:<id>`
//! record (sets carry no TTL). Errors are logged and swallowed; the
//! scheduler keeps running.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use control_plane_core::config::RegistryConfig;

use crate::monitoring::metrics;
use crate::registry::{health_key, HandlerRegistry, RegistryStore};

/// How often the instance sweep runs.
const INSTANCE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// How often route sets are reconciled.
const ROUTE_RECONCILE_INTERVAL: Duration = Duration::from_secs(120);

/// Periodic pruning of expired instances and stale routing entries.
pub struct CleanupScheduler {
    registry: Arc<HandlerRegistry>,
    store: Arc<dyn RegistryStore>,
    config: RegistryConfig,
}

impl CleanupScheduler {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        store: Arc<dyn RegistryStore>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            registry,
            store,
            config,
        }
    }

    /// Remove every instance whose last heartbeat is older than the health
    /// TTL. Returns the number removed.
    pub async fn run_instance_sweep_once(&self) -> usize {
        let now_ms = Utc::now().timestamp_millis();
        let ttl_ms = self.config.health_ttl_seconds as i64 * 1000;

        let mut removed = 0;
        for descriptor in self.registry.known_instances().await {
            let instance_id = descriptor.instance_id.clone();
            let last_heartbeat = self
                .heartbeat_from_health(&instance_id)
                .await
                .unwrap_or(descriptor.last_heartbeat);

            if now_ms - last_heartbeat > ttl_ms {
                match self.registry.remove_instance(&instance_id).await {
                    Ok(()) => {
                        info!(instance_id = %instance_id, "expired instance removed");
                        removed += 1;
                    }
                    Err(error) => {
                        warn!(error = %error, instance_id = %instance_id, "instance sweep failed");
                    }
                }
            }
        }

        if removed > 0 {
            metrics::CLEANUP_REMOVALS.inc_by(removed as u64);
        }
        removed
    }

    /// Drop orphaned route entries. Returns the number removed.
    pub async fn run_route_reconcile_once(&self) -> usize {
        match self.registry.reconcile_route_sets().await {
            Ok(removed) => {
                if removed > 0 {
                    metrics::CLEANUP_REMOVALS.inc_by(removed as u64);
                }
                removed
            }
            Err(error) => {
                warn!(error = %error, "route reconciliation failed");
                0
            }
        }
    }

    /// Spawn both sweeps; each stops on shutdown.
    pub fn start(self: &Arc<Self>, shutdown: &broadcast::Sender<()>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        let scheduler = self.clone();
        let mut stop = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(INSTANCE_SWEEP_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        scheduler.run_instance_sweep_once().await;
                    }
                    _ = stop.recv() => {
                        info!("instance sweep stopping");
                        break;
                    }
                }
            }
        }));

        let scheduler = self.clone();
        let mut stop = shutdown.subscribe();
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(ROUTE_RECONCILE_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        scheduler.run_route_reconcile_once().await;
                    }
                    _ = stop.recv() => {
                        info!("route reconciliation stopping");
                        break;
                    }
                }
            }
        }));

        handles
    }

    async fn heartbeat_from_health(&self, instance_id: &str) -> Option<i64> {
        match self
            .store
            .hash_get(&health_key(instance_id), "last_heartbeat")
            .await
        {
            Ok(Some(raw)) => raw.parse().ok(),
            Ok(None) => None,
            Err(error) => {
                warn!(error = %error, instance_id, "health read failed during sweep");
                None
            }
        }
    }
}
