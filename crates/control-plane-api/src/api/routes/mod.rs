//! Route groups: registry, message submission, event reads, health.

pub mod events;
pub mod health;
pub mod messages;
pub mod registry;
