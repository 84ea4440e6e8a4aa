//! PostgreSQL-backed append-only event log.
//!
//! The `UNIQUE(aggregate_id, sequence_number)` constraint is the source of
//! truth for concurrency failures: a storage-level violation is translated
//! to `SequenceConflict` here, and the lock manager decides whether to
//! retry.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use control_plane_core::error::{ControlPlaneError, Result};

use super::EventRecord;
use crate::db::schema::domain_events;
use crate::db::{DbConnection, DbPool};

/// Append-only event log keyed by `(aggregate_id, sequence_number)`.
///
/// Reads scoped to one aggregate are ordered by sequence number; time-range
/// reads are ordered by timestamp.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventLogStore: Send + Sync {
    /// Append a single event; fails with `SequenceConflict` when the
    /// `(aggregate_id, sequence_number)` pair already exists.
    async fn append(&self, record: &EventRecord) -> Result<()>;

    /// Append a batch atomically; either every record lands or none do.
    async fn append_batch(&self, records: &[EventRecord]) -> Result<()>;

    /// Highest sequence number for the aggregate, `0` if it has no events.
    async fn latest_sequence(&self, aggregate_id: &str) -> Result<i64>;

    /// Events of one aggregate, optionally starting at a sequence number.
    async fn read_by_aggregate(
        &self,
        aggregate_id: &str,
        from_sequence: Option<i64>,
    ) -> Result<Vec<EventRecord>>;

    /// Events of every aggregate of a type within a time range.
    async fn read_by_aggregate_type(
        &self,
        aggregate_type: &str,
        from_ts: Option<DateTime<Utc>>,
        to_ts: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>>;

    /// Events of one type within a time range.
    async fn read_by_event_type(
        &self,
        event_type: &str,
        from_ts: Option<DateTime<Utc>>,
        to_ts: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>>;

    /// Every event recorded after the given timestamp.
    async fn read_after_timestamp(&self, ts: DateTime<Utc>) -> Result<Vec<EventRecord>>;

    /// Number of events stored for the aggregate.
    async fn count_by_aggregate(&self, aggregate_id: &str) -> Result<i64>;
}

/// PostgreSQL implementation of the event log.
pub struct PostgresEventStore {
    pool: Arc<DbPool>,
}

impl PostgresEventStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    fn get_connection(&self) -> Result<DbConnection> {
        self.pool
            .get()
            .map_err(|e| ControlPlaneError::storage(format!("failed to get connection: {}", e)))
    }

    fn latest_sequence_on(conn: &mut PgConnection, aggregate_id: &str) -> Result<i64> {
        let max: Option<i64> = domain_events::table
            .filter(domain_events::aggregate_id.eq(aggregate_id))
            .select(diesel::dsl::max(domain_events::sequence_number))
            .first(conn)
            .map_err(|e| ControlPlaneError::storage(format!("failed to read sequence: {}", e)))?;
        Ok(max.unwrap_or(0))
    }

    /// Map an insert failure, turning unique violations into conflicts.
    fn translate_insert_error(
        conn: &mut PgConnection,
        record: &EventRecord,
        error: DieselError,
    ) -> ControlPlaneError {
        match error {
            DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                let current = Self::latest_sequence_on(conn, &record.aggregate_id)
                    .unwrap_or(record.sequence_number);
                ControlPlaneError::SequenceConflict {
                    aggregate_id: record.aggregate_id.clone(),
                    expected: record.sequence_number,
                    current,
                }
            }
            other => ControlPlaneError::storage(format!("failed to insert event: {}", other)),
        }
    }
}

#[async_trait]
impl EventLogStore for PostgresEventStore {
    async fn append(&self, record: &EventRecord) -> Result<()> {
        let mut conn = self.get_connection()?;
        let row = EventRow::from(record);

        diesel::insert_into(domain_events::table)
            .values(&row)
            .execute(&mut conn)
            .map(|_| ())
            .map_err(|e| Self::translate_insert_error(&mut conn, record, e))
    }

    async fn append_batch(&self, records: &[EventRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let mut conn = self.get_connection()?;

        conn.transaction::<_, TxError, _>(|conn| {
            for record in records {
                let row = EventRow::from(record);
                diesel::insert_into(domain_events::table)
                    .values(&row)
                    .execute(conn)
                    .map_err(|e| TxError::Translated(Self::translate_insert_error(conn, record, e)))?;
            }
            Ok(())
        })
        .map_err(ControlPlaneError::from)
    }

    async fn latest_sequence(&self, aggregate_id: &str) -> Result<i64> {
        let mut conn = self.get_connection()?;
        Self::latest_sequence_on(&mut conn, aggregate_id)
    }

    async fn read_by_aggregate(
        &self,
        aggregate_id: &str,
        from_sequence: Option<i64>,
    ) -> Result<Vec<EventRecord>> {
        let mut conn = self.get_connection()?;

        let mut query = domain_events::table
            .filter(domain_events::aggregate_id.eq(aggregate_id))
            .into_boxed();

        if let Some(from) = from_sequence {
            query = query.filter(domain_events::sequence_number.ge(from));
        }

        let rows: Vec<EventRow> = query
            .order(domain_events::sequence_number.asc())
            .load(&mut conn)
            .map_err(|e| ControlPlaneError::storage(format!("failed to load events: {}", e)))?;

        Ok(rows.into_iter().map(EventRecord::from).collect())
    }

    async fn read_by_aggregate_type(
        &self,
        aggregate_type: &str,
        from_ts: Option<DateTime<Utc>>,
        to_ts: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>> {
        let mut conn = self.get_connection()?;

        let mut query = domain_events::table
            .filter(domain_events::aggregate_type.eq(aggregate_type))
            .into_boxed();

        if let Some(from) = from_ts {
            query = query.filter(domain_events::recorded_at.ge(from));
        }
        if let Some(to) = to_ts {
            query = query.filter(domain_events::recorded_at.le(to));
        }

        let rows: Vec<EventRow> = query
            .order(domain_events::recorded_at.asc())
            .load(&mut conn)
            .map_err(|e| {
                ControlPlaneError::storage(format!("failed to load events by aggregate type: {}", e))
            })?;

        Ok(rows.into_iter().map(EventRecord::from).collect())
    }

    async fn read_by_event_type(
        &self,
        event_type: &str,
        from_ts: Option<DateTime<Utc>>,
        to_ts: Option<DateTime<Utc>>,
    ) -> Result<Vec<EventRecord>> {
        let mut conn = self.get_connection()?;

        let mut query = domain_events::table
            .filter(domain_events::event_type.eq(event_type))
            .into_boxed();

        if let Some(from) = from_ts {
            query = query.filter(domain_events::recorded_at.ge(from));
        }
        if let Some(to) = to_ts {
            query = query.filter(domain_events::recorded_at.le(to));
        }

        let rows: Vec<EventRow> = query
            .order(domain_events::recorded_at.asc())
            .load(&mut conn)
            .map_err(|e| {
                ControlPlaneError::storage(format!("failed to load events by event type: {}", e))
            })?;

        Ok(rows.into_iter().map(EventRecord::from).collect())
    }

    async fn read_after_timestamp(&self, ts: DateTime<Utc>) -> Result<Vec<EventRecord>> {
        let mut conn = self.get_connection()?;

        let rows: Vec<EventRow> = domain_events::table
            .filter(domain_events::recorded_at.gt(ts))
            .order(domain_events::recorded_at.asc())
            .load(&mut conn)
            .map_err(|e| {
                ControlPlaneError::storage(format!("failed to load events after timestamp: {}", e))
            })?;

        Ok(rows.into_iter().map(EventRecord::from).collect())
    }

    async fn count_by_aggregate(&self, aggregate_id: &str) -> Result<i64> {
        let mut conn = self.get_connection()?;

        domain_events::table
            .filter(domain_events::aggregate_id.eq(aggregate_id))
            .count()
            .get_result(&mut conn)
            .map_err(|e| ControlPlaneError::storage(format!("failed to count events: {}", e)))
    }
}

/// Transaction-local error carrier satisfying diesel's `From` bound.
enum TxError {
    Diesel(DieselError),
    Translated(ControlPlaneError),
}

impl From<DieselError> for TxError {
    fn from(error: DieselError) -> Self {
        TxError::Diesel(error)
    }
}

impl From<TxError> for ControlPlaneError {
    fn from(error: TxError) -> Self {
        match error {
            TxError::Diesel(e) => ControlPlaneError::storage(format!("transaction failed: {}", e)),
            TxError::Translated(e) => e,
        }
    }
}

#[derive(Debug, Clone, Queryable, Insertable, Selectable)]
#[diesel(table_name = domain_events)]
struct EventRow {
    id: Uuid,
    aggregate_id: String,
    aggregate_type: String,
    sequence_number: i64,
    event_type: String,
    payload: Value,
    metadata: Value,
    recorded_at: DateTime<Utc>,
}

impl From<&EventRecord> for EventRow {
    fn from(record: &EventRecord) -> Self {
        Self {
            id: record.id,
            aggregate_id: record.aggregate_id.clone(),
            aggregate_type: record.aggregate_type.clone(),
            sequence_number: record.sequence_number,
            event_type: record.event_type.clone(),
            payload: record.payload.clone(),
            metadata: record.metadata.clone(),
            recorded_at: record.recorded_at,
        }
    }
}

impl From<EventRow> for EventRecord {
    fn from(row: EventRow) -> Self {
        Self {
            id: row.id,
            aggregate_id: row.aggregate_id,
            aggregate_type: row.aggregate_type,
            sequence_number: row.sequence_number,
            event_type: row.event_type,
            payload: row.payload,
            metadata: row.metadata,
            recorded_at: row.recorded_at,
        }
    }
}
