//! Persistent storage: schema, connection pooling, and the event-sourcing
//! stores.

pub mod events;
pub mod schema;

use diesel::r2d2::{ConnectionManager, Pool, PooledConnection};
use diesel::PgConnection;

use control_plane_core::error::ControlPlaneError;

/// Shared postgres connection pool.
pub type DbPool = Pool<ConnectionManager<PgConnection>>;

/// A connection checked out of the pool.
pub type DbConnection = PooledConnection<ConnectionManager<PgConnection>>;

/// Build the postgres connection pool for the event and snapshot stores.
pub fn init_pool(database_url: &str, pool_size: u32) -> Result<DbPool, ControlPlaneError> {
    let manager = ConnectionManager::<PgConnection>::new(database_url);
    Pool::builder()
        .max_size(pool_size)
        .build(manager)
        .map_err(|e| ControlPlaneError::storage(format!("failed to create connection pool: {}", e)))
}
