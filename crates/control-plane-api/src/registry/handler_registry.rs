//! Handler registry and router.
//!
//! Workers register the message types they handle; submitters ask for a
//! target. Command routing is deterministic: the live handler list is
//! ordered lexicographically by instance id and indexed by a stable hash of
//! the aggregate id, so two nodes computing the mapping from the same
//! registry contents agree. Query routing is uniform random; event handlers
//! are discovered as a set (broadcast semantics).
//!
//! Liveness: an instance is live iff its `health:<id>` hash exists (TTL not
//! expired) and reports `HEALTHY`. Registry reads degrade to empty on
//! backend failure; writes fail fast.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use rand::Rng;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use control_plane_core::config::RegistryConfig;
use control_plane_core::context::RequestContext;
use control_plane_core::error::{ControlPlaneError, Result};
use control_plane_core::instance::{InstanceDescriptor, InstanceStatus, MessageKind};

use super::{
    handlers_key, health_key, instance_key, route_key, service_key, RegistryStore, ROUTE_PREFIX,
};

/// Per-kind binding counts reported by register/unregister.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct BindingCounts {
    pub commands: usize,
    pub queries: usize,
    pub events: usize,
}

impl BindingCounts {
    pub fn total(&self) -> usize {
        self.commands + self.queries + self.events
    }
}

/// Outcome of a successful registration.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RegistrationSummary {
    pub registration_id: String,
    pub counts: BindingCounts,
}

/// Durable routing table over the registry store, with a soft in-memory
/// descriptor cache. Canonical state lives in the store.
pub struct HandlerRegistry {
    store: Arc<dyn RegistryStore>,
    config: RegistryConfig,
    cache: RwLock<HashMap<String, InstanceDescriptor>>,
}

impl HandlerRegistry {
    pub fn new(store: Arc<dyn RegistryStore>, config: RegistryConfig) -> Self {
        Self {
            store,
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Register a worker instance: upsert its record and health with TTL,
    /// and index every `(kind, type)` binding both ways.
    ///
    /// Idempotent; a repeated identical registration converges to the same
    /// registry state.
    pub async fn register(
        &self,
        descriptor: &InstanceDescriptor,
        ctx: &RequestContext,
    ) -> Result<RegistrationSummary> {
        if descriptor.instance_id.is_empty() {
            return Err(ControlPlaneError::validation("instance_id must not be empty"));
        }
        if descriptor.service_name.is_empty() {
            return Err(ControlPlaneError::validation("service_name must not be empty"));
        }

        let ttl = self.config.health_ttl();
        let instance_id = &descriptor.instance_id;

        let mut stored = descriptor.clone();
        stored.status = InstanceStatus::Healthy;
        stored.last_heartbeat = Utc::now().timestamp_millis();

        let serialized = serde_json::to_string(&stored)?;
        self.store.put_value(&instance_key(instance_id), &serialized).await?;
        self.store.expire(&instance_key(instance_id), ttl).await?;

        self.store
            .hash_put_all(&health_key(instance_id), &health_fields(&stored))
            .await?;
        self.store.expire(&health_key(instance_id), ttl).await?;

        for kind in MessageKind::ALL {
            for message_type in descriptor.types_for(kind) {
                self.store
                    .set_add(&route_key(kind, message_type), instance_id)
                    .await?;
                self.store
                    .set_add(&handlers_key(kind, instance_id), message_type)
                    .await?;
            }
        }

        self.store
            .set_add(&service_key(&descriptor.service_name), instance_id)
            .await?;

        self.cache.write().await.insert(instance_id.clone(), stored);

        let counts = BindingCounts {
            commands: descriptor.command_types.len(),
            queries: descriptor.query_types.len(),
            events: descriptor.event_types.len(),
        };

        info!(
            instance_id = %instance_id,
            service = %descriptor.service_name,
            correlation_id = %ctx.correlation_id,
            commands = counts.commands,
            queries = counts.queries,
            events = counts.events,
            "instance registered"
        );

        Ok(RegistrationSummary {
            registration_id: instance_id.clone(),
            counts,
        })
    }

    /// Remove bindings of the given kinds (all kinds when `None`). When no
    /// bindings remain, the instance record and health are removed too.
    ///
    /// A no-op for unknown instances.
    pub async fn unregister(
        &self,
        instance_id: &str,
        kinds: Option<&[MessageKind]>,
    ) -> Result<BindingCounts> {
        let kinds: Vec<MessageKind> = match kinds {
            Some(kinds) => kinds.to_vec(),
            None => MessageKind::ALL.to_vec(),
        };

        let mut counts = BindingCounts::default();

        for kind in &kinds {
            let types = self.store.set_members(&handlers_key(*kind, instance_id)).await?;
            for message_type in &types {
                self.store
                    .set_remove(&route_key(*kind, message_type), instance_id)
                    .await?;
            }
            match kind {
                MessageKind::Command => counts.commands = types.len(),
                MessageKind::Query => counts.queries = types.len(),
                MessageKind::Event => counts.events = types.len(),
            }
            self.store.delete(&handlers_key(*kind, instance_id)).await?;
        }

        let mut remaining = 0;
        for kind in MessageKind::ALL {
            remaining += self.store.set_size(&handlers_key(kind, instance_id)).await?;
        }

        if remaining == 0 {
            self.remove_instance(instance_id).await?;
        }

        info!(
            instance_id = %instance_id,
            removed = counts.total(),
            remaining,
            "instance unregistered"
        );

        Ok(counts)
    }

    /// Deterministic command routing: the same aggregate maps to the same
    /// live instance while the live-handler set is unchanged.
    pub async fn route_command(&self, command_type: &str, aggregate_id: &str) -> Result<String> {
        let mut live = self.live_instance_ids(MessageKind::Command, command_type).await;
        if live.is_empty() {
            return Err(ControlPlaneError::NoHealthyHandler {
                kind: MessageKind::Command.as_str().to_string(),
                message_type: command_type.to_string(),
            });
        }

        live.sort();
        let index = (stable_hash(aggregate_id) % live.len() as u64) as usize;
        let target = live[index].clone();

        debug!(
            command_type,
            aggregate_id,
            target = %target,
            candidates = live.len(),
            "command routed"
        );

        Ok(target)
    }

    /// Uniform random routing among live query handlers.
    pub async fn route_query(&self, query_type: &str) -> Result<String> {
        let live = self.live_instance_ids(MessageKind::Query, query_type).await;
        if live.is_empty() {
            return Err(ControlPlaneError::NoHealthyHandler {
                kind: MessageKind::Query.as_str().to_string(),
                message_type: query_type.to_string(),
            });
        }

        let index = rand::thread_rng().gen_range(0..live.len());
        Ok(live[index].clone())
    }

    /// Every live handler of an event type; events are broadcast.
    pub async fn discover_event_handlers(&self, event_type: &str) -> Vec<InstanceDescriptor> {
        self.discover(MessageKind::Event, event_type, true).await
    }

    /// Registered handlers of a message type, optionally restricted to live
    /// instances. Degrades to empty on backend failure.
    pub async fn discover(
        &self,
        kind: MessageKind,
        message_type: &str,
        only_healthy: bool,
    ) -> Vec<InstanceDescriptor> {
        let ids = self.members_or_empty(&route_key(kind, message_type)).await;

        let mut descriptors = Vec::with_capacity(ids.len());
        for id in ids {
            if only_healthy && !self.is_live(&id).await {
                continue;
            }
            if let Some(descriptor) = self.descriptor(&id).await {
                descriptors.push(descriptor);
            }
        }
        descriptors.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        descriptors
    }

    /// Message types of one kind handled by the instance.
    pub async fn handled_types(&self, instance_id: &str, kind: MessageKind) -> BTreeSet<String> {
        self.members_or_empty(&handlers_key(kind, instance_id))
            .await
            .into_iter()
            .collect()
    }

    /// Instance ids registered for a message type, sorted.
    pub async fn instances_for(&self, kind: MessageKind, message_type: &str) -> Vec<String> {
        let mut ids = self.members_or_empty(&route_key(kind, message_type)).await;
        ids.sort();
        ids
    }

    /// Idempotent full cleanup of an instance: every binding, the service
    /// membership, the record, and health.
    pub async fn remove_instance(&self, instance_id: &str) -> Result<()> {
        for kind in MessageKind::ALL {
            let types = self.store.set_members(&handlers_key(kind, instance_id)).await?;
            for message_type in &types {
                self.store
                    .set_remove(&route_key(kind, message_type), instance_id)
                    .await?;
            }
            self.store.delete(&handlers_key(kind, instance_id)).await?;
        }

        if let Some(descriptor) = self.descriptor(instance_id).await {
            self.store
                .set_remove(&service_key(&descriptor.service_name), instance_id)
                .await?;
        }

        self.store.delete(&instance_key(instance_id)).await?;
        self.store.delete(&health_key(instance_id)).await?;
        self.cache.write().await.remove(instance_id);

        debug!(instance_id, "instance removed");
        Ok(())
    }

    /// Known instances of a service, by id.
    pub async fn service_instances(&self, service_name: &str) -> Vec<String> {
        let mut ids = self.members_or_empty(&service_key(service_name)).await;
        ids.sort();
        ids
    }

    /// All known instances with their liveness, for monitors.
    pub async fn list_instances(&self) -> Vec<(InstanceDescriptor, bool)> {
        let keys = match self.store.keys(super::INSTANCE_PREFIX).await {
            Ok(keys) => keys,
            Err(error) => {
                warn!(%error, "registry read failed, degrading to empty");
                return Vec::new();
            }
        };

        let mut instances = Vec::with_capacity(keys.len());
        for key in keys {
            let id = key.trim_start_matches(super::INSTANCE_PREFIX).to_string();
            if let Some(descriptor) = self.descriptor(&id).await {
                let live = self.is_live(&id).await;
                instances.push((descriptor, live));
            }
        }
        instances.sort_by(|a, b| a.0.instance_id.cmp(&b.0.instance_id));
        instances
    }

    /// Route-set reconciliation: drop instance ids whose `instance:<id>`
    /// record no longer exists. Returns the number of removals.
    pub async fn reconcile_route_sets(&self) -> Result<usize> {
        let route_keys = self.store.keys(ROUTE_PREFIX).await?;
        let mut removed = 0;

        for key in route_keys {
            let members = self.store.set_members(&key).await?;
            for id in members {
                let exists = self.store.get_value(&instance_key(&id)).await?.is_some();
                if !exists {
                    self.store.set_remove(&key, &id).await?;
                    removed += 1;
                }
            }
        }

        if removed > 0 {
            info!(removed, "route sets reconciled");
        }
        Ok(removed)
    }

    /// Descriptors currently known to the registry, with last-heartbeat
    /// millis, for the instance sweep.
    pub async fn known_instances(&self) -> Vec<InstanceDescriptor> {
        self.list_instances().await.into_iter().map(|(d, _)| d).collect()
    }

    /// Live = health hash present (TTL not expired) and status HEALTHY.
    pub async fn is_live(&self, instance_id: &str) -> bool {
        match self.store.hash_get(&health_key(instance_id), "status").await {
            Ok(Some(status)) => InstanceStatus::parse(&status)
                .map(|s| s.is_routable())
                .unwrap_or(false),
            Ok(None) => false,
            Err(error) => {
                warn!(%error, instance_id, "health read failed, treating as not alive");
                false
            }
        }
    }

    async fn live_instance_ids(&self, kind: MessageKind, message_type: &str) -> Vec<String> {
        let ids = self.members_or_empty(&route_key(kind, message_type)).await;
        let mut live = Vec::with_capacity(ids.len());
        for id in ids {
            if self.is_live(&id).await {
                live.push(id);
            }
        }
        live
    }

    async fn members_or_empty(&self, key: &str) -> Vec<String> {
        match self.store.set_members(key).await {
            Ok(members) => members,
            Err(error) => {
                warn!(%error, key, "registry read failed, degrading to empty");
                Vec::new()
            }
        }
    }

    /// Read-through descriptor lookup; the cache is advisory only.
    async fn descriptor(&self, instance_id: &str) -> Option<InstanceDescriptor> {
        match self.store.get_value(&instance_key(instance_id)).await {
            Ok(Some(raw)) => match serde_json::from_str::<InstanceDescriptor>(&raw) {
                Ok(descriptor) => {
                    self.cache
                        .write()
                        .await
                        .insert(instance_id.to_string(), descriptor.clone());
                    Some(descriptor)
                }
                Err(error) => {
                    warn!(%error, instance_id, "corrupt instance record");
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                warn!(%error, instance_id, "registry read failed");
                self.cache.read().await.get(instance_id).cloned()
            }
        }
    }
}

fn health_fields(descriptor: &InstanceDescriptor) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    fields.insert("status".to_string(), descriptor.status.as_str().to_string());
    fields.insert(
        "last_heartbeat".to_string(),
        descriptor.last_heartbeat.to_string(),
    );
    fields.insert("host".to_string(), descriptor.host.clone());
    fields.insert("port".to_string(), descriptor.port.to_string());
    fields
}

/// Stable hash shared by every node routing commands: first eight bytes of
/// the md5 digest, big-endian.
pub fn stable_hash(value: &str) -> u64 {
    let digest = md5::compute(value.as_bytes()).0;
    u64::from_be_bytes([
        digest[0], digest[1], digest[2], digest[3], digest[4], digest[5], digest[6], digest[7],
    ])
}
