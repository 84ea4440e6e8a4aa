//! # Control Plane Core
//!
//! Shared foundation for the control-plane server: the error taxonomy used
//! across every component, the retry policy driving optimistic concurrency,
//! configuration loading, the explicit request context, and the worker
//! instance model (descriptors, handler kinds, health records).
//!
//! Storage backends, routing, and the HTTP surface live in
//! `control-plane-api`; this crate stays dependency-light so that store
//! implementations and transports can share the same vocabulary.

pub mod config;
pub mod context;
pub mod error;
pub mod instance;

pub use config::{ControlPlaneConfig, LockRetryConfig, SnapshotConfig};
pub use context::RequestContext;
pub use error::{ControlPlaneError, Result};
pub use instance::{
    HealthChange, HealthRecord, InstanceDescriptor, InstanceStatus, MessageKind,
};
