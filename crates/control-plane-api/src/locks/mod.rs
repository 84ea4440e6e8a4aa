//! Per-aggregate concurrency control.
//!
//! One fair readers-writer lock per aggregate serializes writes to that
//! aggregate inside this process; the storage-layer uniqueness constraint
//! covers races across processes. The optimistic wrapper retries sequence
//! conflicts with exponential backoff and surfaces the last conflict after
//! exhaustion.
//!
//! Locks are created on first reference and never reclaimed automatically;
//! `clear_unused` exists as a test seam. Guards are released on every exit
//! path, including error propagation and future cancellation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::RwLock;

use control_plane_core::error::{retry_with_policy, ControlPlaneError, Result, RetryPolicy};

/// Map of `aggregate_id → fair readers-writer lock` plus the optimistic
/// retry policy.
pub struct AggregateLockManager {
    locks: RwLock<HashMap<String, Arc<RwLock<()>>>>,
    retry_policy: RetryPolicy,
}

impl AggregateLockManager {
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            locks: RwLock::new(HashMap::new()),
            retry_policy,
        }
    }

    /// Run `operation` holding the aggregate's read lock.
    pub async fn with_read<F, Fut, T>(&self, aggregate_id: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self.lock_for(aggregate_id).await;
        let _guard = lock.read().await;
        operation().await
    }

    /// Run `operation` holding the aggregate's write lock.
    pub async fn with_write<F, Fut, T>(&self, aggregate_id: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self.lock_for(aggregate_id).await;
        let _guard = lock.write().await;
        operation().await
    }

    /// Run `operation` under the optimistic-retry policy: sequence
    /// conflicts are retried with backoff, everything else surfaces
    /// immediately.
    pub async fn with_optimistic<F, Fut, T>(&self, aggregate_id: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        tracing::trace!(aggregate_id, "optimistic section");
        retry_with_policy(&self.retry_policy, operation).await
    }

    /// Write lock plus optimistic retry: the serialization used for every
    /// append path.
    pub async fn with_full<F, Fut, T>(&self, aggregate_id: &str, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let lock = self.lock_for(aggregate_id).await;
        let _guard = lock.write().await;
        retry_with_policy(&self.retry_policy, operation).await
    }

    /// Fail with a conflict when an expectation is present and wrong.
    pub fn validate_version(
        &self,
        aggregate_id: &str,
        expected: Option<i64>,
        actual: i64,
    ) -> Result<()> {
        match expected {
            Some(expected) if expected != actual => Err(ControlPlaneError::SequenceConflict {
                aggregate_id: aggregate_id.to_string(),
                expected,
                current: actual,
            }),
            _ => Ok(()),
        }
    }

    /// Number of aggregate locks currently materialized.
    pub async fn len(&self) -> usize {
        self.locks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.locks.read().await.is_empty()
    }

    /// Drop locks nobody holds. Test seam; production leaves locks in
    /// place for the lifetime of the process.
    pub async fn clear_unused(&self) {
        let mut locks = self.locks.write().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1 || lock.try_write().is_err());
    }

    async fn lock_for(&self, aggregate_id: &str) -> Arc<RwLock<()>> {
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(aggregate_id) {
                return lock.clone();
            }
        }

        let mut locks = self.locks.write().await;
        locks
            .entry(aggregate_id.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }
}

impl Default for AggregateLockManager {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
