//! Event store service: append with sequence validation, snapshot policy,
//! replay, and the broker publish seam.

pub mod publisher;
pub mod service;

pub use publisher::{EventPublisher, LoggingEventPublisher};
pub use service::EventStoreService;
