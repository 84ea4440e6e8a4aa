//! Worker instance model.
//!
//! A worker registers one [`InstanceDescriptor`] announcing the command,
//! query, and event types it handles. Liveness is tracked separately as a
//! TTL-bound [`HealthRecord`]; an instance is *live* only while that record
//! exists and reports [`InstanceStatus::Healthy`].

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// The three kinds of routable messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Command,
    Query,
    Event,
}

impl MessageKind {
    pub const ALL: [MessageKind; 3] = [MessageKind::Command, MessageKind::Query, MessageKind::Event];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Command => "command",
            MessageKind::Query => "query",
            MessageKind::Event => "event",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "command" => Some(MessageKind::Command),
            "query" => Some(MessageKind::Query),
            "event" => Some(MessageKind::Event),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a worker instance.
///
/// `Starting → Healthy → (Unhealthy ↔ Healthy) → Stopping → removed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Starting,
    Healthy,
    Unhealthy,
    Unknown,
    Stopping,
}

impl InstanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Starting => "STARTING",
            InstanceStatus::Healthy => "HEALTHY",
            InstanceStatus::Unhealthy => "UNHEALTHY",
            InstanceStatus::Unknown => "UNKNOWN",
            InstanceStatus::Stopping => "STOPPING",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "STARTING" => Some(InstanceStatus::Starting),
            "HEALTHY" => Some(InstanceStatus::Healthy),
            "UNHEALTHY" => Some(InstanceStatus::Unhealthy),
            "UNKNOWN" => Some(InstanceStatus::Unknown),
            "STOPPING" => Some(InstanceStatus::Stopping),
            _ => None,
        }
    }

    /// Whether an instance in this status accepts routed traffic.
    pub fn is_routable(&self) -> bool {
        matches!(self, InstanceStatus::Healthy)
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity and capabilities of a worker instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDescriptor {
    /// Unique, immutable instance id.
    pub instance_id: String,
    pub service_name: String,
    pub host: String,
    pub port: u16,
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub command_types: BTreeSet<String>,
    #[serde(default)]
    pub query_types: BTreeSet<String>,
    #[serde(default)]
    pub event_types: BTreeSet<String>,
    pub status: InstanceStatus,
    /// Last heartbeat, epoch milliseconds.
    pub last_heartbeat: i64,
}

impl InstanceDescriptor {
    /// Descriptor for a newly registered instance.
    pub fn new(
        instance_id: impl Into<String>,
        service_name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            service_name: service_name.into(),
            host: host.into(),
            port,
            version: String::new(),
            metadata: HashMap::new(),
            command_types: BTreeSet::new(),
            query_types: BTreeSet::new(),
            event_types: BTreeSet::new(),
            status: InstanceStatus::Starting,
            last_heartbeat: Utc::now().timestamp_millis(),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_command_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_query_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_event_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.event_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Message types of one kind.
    pub fn types_for(&self, kind: MessageKind) -> &BTreeSet<String> {
        match kind {
            MessageKind::Command => &self.command_types,
            MessageKind::Query => &self.query_types,
            MessageKind::Event => &self.event_types,
        }
    }

    /// Routable endpoint derived from the descriptor.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Liveness record kept under `health:<instance_id>` with a TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub instance_id: String,
    pub status: InstanceStatus,
    /// Last heartbeat, epoch milliseconds.
    pub last_heartbeat: i64,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl HealthRecord {
    pub fn new(instance_id: impl Into<String>, status: InstanceStatus) -> Self {
        Self {
            instance_id: instance_id.into(),
            status,
            last_heartbeat: Utc::now().timestamp_millis(),
            extra: HashMap::new(),
        }
    }
}

/// A single health transition pushed to stream subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthChange {
    pub instance_id: String,
    pub status: InstanceStatus,
    pub timestamp_ms: i64,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl HealthChange {
    pub fn new(instance_id: impl Into<String>, status: InstanceStatus) -> Self {
        Self {
            instance_id: instance_id.into(),
            status,
            timestamp_ms: Utc::now().timestamp_millis(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}
