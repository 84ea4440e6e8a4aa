//! Broker publish seam.
//!
//! The pub/sub broker fanning stored events out to projections is an
//! external collaborator; the service only needs a fire-and-forget publish
//! hook. Publish failures never fail the append.

use async_trait::async_trait;

use control_plane_core::error::Result;

use crate::db::events::EventRecord;

/// Downstream publication of stored events.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, record: &EventRecord) -> Result<()>;
}

/// Default publisher: traces the publication and does nothing else.
#[derive(Default)]
pub struct LoggingEventPublisher;

impl LoggingEventPublisher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventPublisher for LoggingEventPublisher {
    async fn publish(&self, record: &EventRecord) -> Result<()> {
        tracing::debug!(
            event_id = %record.id,
            aggregate_id = %record.aggregate_id,
            sequence = record.sequence_number,
            event_type = %record.event_type,
            "event published"
        );
        Ok(())
    }
}
