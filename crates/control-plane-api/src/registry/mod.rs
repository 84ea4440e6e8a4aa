//! Routing-table storage: the typed key-value façade and its backends.
//!
//! Key schema:
//!
//! | key | type | contents |
//! |-----|------|----------|
//! | `route:<kind>:<type>` | set | instance ids handling that message type |
//! | `handlers:<kind>:<instance_id>` | set | message types of that kind handled |
//! | `health:<instance_id>` | hash | status, last_heartbeat, host, port, extra |
//! | `instance:<instance_id>` | value | serialized descriptor |
//! | `service:<service_name>` | set | instance ids of that service |
//!
//! Every `health:*` and `instance:*` write carries a TTL; a missing or
//! expired record means the instance is not alive.

pub mod handler_registry;
pub mod memory;
pub mod redis_store;

pub use handler_registry::{BindingCounts, HandlerRegistry, RegistrationSummary};
pub use memory::InMemoryRegistryStore;
pub use redis_store::RedisRegistryStore;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;

use control_plane_core::error::Result;
use control_plane_core::instance::MessageKind;

pub const ROUTE_PREFIX: &str = "route:";
pub const HANDLERS_PREFIX: &str = "handlers:";
pub const HEALTH_PREFIX: &str = "health:";
pub const INSTANCE_PREFIX: &str = "instance:";
pub const SERVICE_PREFIX: &str = "service:";

pub fn route_key(kind: MessageKind, message_type: &str) -> String {
    format!("{}{}:{}", ROUTE_PREFIX, kind.as_str(), message_type)
}

pub fn handlers_key(kind: MessageKind, instance_id: &str) -> String {
    format!("{}{}:{}", HANDLERS_PREFIX, kind.as_str(), instance_id)
}

pub fn health_key(instance_id: &str) -> String {
    format!("{}{}", HEALTH_PREFIX, instance_id)
}

pub fn instance_key(instance_id: &str) -> String {
    format!("{}{}", INSTANCE_PREFIX, instance_id)
}

pub fn service_key(service_name: &str) -> String {
    format!("{}{}", SERVICE_PREFIX, service_name)
}

/// Typed façade over the external key-value system backing the routing
/// table and liveness records.
///
/// Multi-step callers (register, unregister, remove) must stay idempotent:
/// partial failure is possible and re-execution must converge to the same
/// end state.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistryStore: Send + Sync {
    async fn set_add(&self, key: &str, value: &str) -> Result<()>;

    async fn set_remove(&self, key: &str, value: &str) -> Result<()>;

    /// Members of a set; empty for a missing key.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    async fn set_size(&self, key: &str) -> Result<usize>;

    async fn hash_put_all(&self, key: &str, entries: &HashMap<String, String>) -> Result<()>;

    /// Whole hash; empty for a missing key.
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>>;

    async fn put_value(&self, key: &str, value: &str) -> Result<()>;

    async fn get_value(&self, key: &str) -> Result<Option<String>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys starting with the given prefix.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Attach a TTL to an existing key; no-op for a missing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
}
