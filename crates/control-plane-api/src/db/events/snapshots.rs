//! PostgreSQL-backed snapshot store.
//!
//! One row per aggregate, replaced on every upsert; the daily retention
//! sweep deletes rows older than the configured cutoff.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use control_plane_core::error::{ControlPlaneError, Result};

use super::SnapshotRecord;
use crate::db::schema::aggregate_snapshots;
use crate::db::{DbConnection, DbPool};

/// Store holding at most one state blob per aggregate.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Insert or replace the snapshot for the record's aggregate.
    async fn upsert(&self, snapshot: &SnapshotRecord) -> Result<()>;

    async fn get(&self, aggregate_id: &str) -> Result<Option<SnapshotRecord>>;

    async fn delete(&self, aggregate_id: &str) -> Result<()>;

    async fn list_by_type(&self, aggregate_type: &str) -> Result<Vec<SnapshotRecord>>;

    /// Delete snapshots recorded before the cutoff, returning how many.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// PostgreSQL implementation of the snapshot store.
pub struct PostgresSnapshotStore {
    pool: Arc<DbPool>,
}

impl PostgresSnapshotStore {
    pub fn new(pool: Arc<DbPool>) -> Self {
        Self { pool }
    }

    fn get_connection(&self) -> Result<DbConnection> {
        self.pool
            .get()
            .map_err(|e| ControlPlaneError::storage(format!("failed to get connection: {}", e)))
    }
}

#[async_trait]
impl SnapshotStore for PostgresSnapshotStore {
    async fn upsert(&self, snapshot: &SnapshotRecord) -> Result<()> {
        let mut conn = self.get_connection()?;
        let row = SnapshotRow::from(snapshot);

        diesel::insert_into(aggregate_snapshots::table)
            .values(&row)
            .on_conflict(aggregate_snapshots::aggregate_id)
            .do_update()
            .set((
                aggregate_snapshots::aggregate_type.eq(&row.aggregate_type),
                aggregate_snapshots::sequence_number.eq(row.sequence_number),
                aggregate_snapshots::payload.eq(&row.payload),
                aggregate_snapshots::recorded_at.eq(row.recorded_at),
            ))
            .execute(&mut conn)
            .map(|_| ())
            .map_err(|e| ControlPlaneError::storage(format!("failed to upsert snapshot: {}", e)))
    }

    async fn get(&self, aggregate_id: &str) -> Result<Option<SnapshotRecord>> {
        let mut conn = self.get_connection()?;

        let row: Option<SnapshotRow> = aggregate_snapshots::table
            .filter(aggregate_snapshots::aggregate_id.eq(aggregate_id))
            .first(&mut conn)
            .optional()
            .map_err(|e| ControlPlaneError::storage(format!("failed to load snapshot: {}", e)))?;

        Ok(row.map(SnapshotRecord::from))
    }

    async fn delete(&self, aggregate_id: &str) -> Result<()> {
        let mut conn = self.get_connection()?;

        diesel::delete(
            aggregate_snapshots::table.filter(aggregate_snapshots::aggregate_id.eq(aggregate_id)),
        )
        .execute(&mut conn)
        .map(|_| ())
        .map_err(|e| ControlPlaneError::storage(format!("failed to delete snapshot: {}", e)))
    }

    async fn list_by_type(&self, aggregate_type: &str) -> Result<Vec<SnapshotRecord>> {
        let mut conn = self.get_connection()?;

        let rows: Vec<SnapshotRow> = aggregate_snapshots::table
            .filter(aggregate_snapshots::aggregate_type.eq(aggregate_type))
            .order(aggregate_snapshots::aggregate_id.asc())
            .load(&mut conn)
            .map_err(|e| ControlPlaneError::storage(format!("failed to list snapshots: {}", e)))?;

        Ok(rows.into_iter().map(SnapshotRecord::from).collect())
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.get_connection()?;

        diesel::delete(aggregate_snapshots::table.filter(aggregate_snapshots::recorded_at.lt(cutoff)))
            .execute(&mut conn)
            .map_err(|e| {
                ControlPlaneError::storage(format!("failed to delete old snapshots: {}", e))
            })
    }
}

#[derive(Debug, Clone, Queryable, Insertable, Selectable)]
#[diesel(table_name = aggregate_snapshots)]
struct SnapshotRow {
    id: Uuid,
    aggregate_id: String,
    aggregate_type: String,
    sequence_number: i64,
    payload: Value,
    recorded_at: DateTime<Utc>,
}

impl From<&SnapshotRecord> for SnapshotRow {
    fn from(snapshot: &SnapshotRecord) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id: snapshot.aggregate_id.clone(),
            aggregate_type: snapshot.aggregate_type.clone(),
            sequence_number: snapshot.sequence_number,
            payload: snapshot.payload.clone(),
            recorded_at: snapshot.recorded_at,
        }
    }
}

impl From<SnapshotRow> for SnapshotRecord {
    fn from(row: SnapshotRow) -> Self {
        Self {
            aggregate_id: row.aggregate_id,
            aggregate_type: row.aggregate_type,
            sequence_number: row.sequence_number,
            payload: row.payload,
            recorded_at: row.recorded_at,
        }
    }
}
