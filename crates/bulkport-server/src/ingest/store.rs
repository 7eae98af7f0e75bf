//! Job repository
//!
//! [`JobStore`] is the key-value store seam. Implementations must make
//! [`JobStore::increment_counters`] a single atomic write that returns the
//! post-increment row, and must never let a status update overwrite a terminal
//! status.
//!
//! Batch writes are best-effort: [`batch_put`] and [`batch_delete`] retry only the
//! items the store reported as unprocessed, backing off exponentially, and log and
//! abandon whatever is left once the attempt budget runs out.

use async_trait::async_trait;
use bulkport_common::JobKey;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::model::{ImportJob, JobPatch, Outcome, RowTotals};
use crate::error::{ImportError, ImportResult};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Connectivity check behind `GET /health`
    async fn ping(&self) -> ImportResult<()>;

    /// Insert or replace a job record
    async fn put(&self, job: &ImportJob) -> ImportResult<()>;

    async fn get(&self, key: &JobKey) -> ImportResult<Option<ImportJob>>;

    /// Merge `patch` into the stored job.
    ///
    /// Returns `Ok(None)` without writing when the patch carries a status and the
    /// stored job is already terminal. Missing jobs are `JobNotFound`.
    async fn update(&self, key: &JobKey, patch: &JobPatch) -> ImportResult<Option<ImportJob>>;

    /// Atomically add one processed child to the job's counters
    async fn increment_counters(&self, key: &JobKey, outcome: Outcome) -> ImportResult<ImportJob>;

    async fn set_total_rows(&self, key: &JobKey, total_rows: i64) -> ImportResult<ImportJob>;

    /// Overwrite all four counters at once
    async fn record_totals(&self, key: &JobKey, totals: RowTotals) -> ImportResult<ImportJob>;

    /// Jobs whose `parent_key` is `parent`
    async fn list_children(&self, parent: &JobKey) -> ImportResult<Vec<ImportJob>>;

    /// Single write attempt; returns the jobs that were not written
    async fn batch_write_raw(&self, jobs: &[ImportJob]) -> ImportResult<Vec<ImportJob>>;

    /// Single delete attempt; returns the keys that were not deleted
    async fn batch_delete_raw(&self, keys: &[JobKey]) -> ImportResult<Vec<JobKey>>;
}

/// Bounded exponential backoff
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(2_u32.saturating_pow(attempt))
    }

    /// Run `op`, retrying while it fails with [`ImportError::StoreCondition`].
    ///
    /// Once the budget is spent the last condition error is returned.
    pub async fn retry_conditional<T, F, Fut>(&self, mut op: F) -> ImportResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ImportResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Err(err @ ImportError::StoreCondition { .. }) if attempt < self.max_attempts => {
                    attempt += 1;
                    let delay = self.delay_for(attempt);
                    debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "Retrying conditional write");
                    tokio::time::sleep(delay).await;
                },
                other => return other,
            }
        }
    }
}

/// What a best-effort batch operation achieved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Retries after the first attempt
    pub retries: u32,
    pub abandoned: usize,
}

async fn run_batch<T, F, Fut>(
    operation: &'static str,
    items: Vec<T>,
    policy: &RetryPolicy,
    mut attempt_once: F,
) -> ImportResult<BatchReport>
where
    T: Send,
    F: FnMut(Vec<T>) -> Fut,
    Fut: Future<Output = ImportResult<Vec<T>>>,
{
    let mut unprocessed = attempt_once(items).await?;
    let mut retries = 0;

    while !unprocessed.is_empty() && retries < policy.max_attempts {
        retries += 1;
        let delay = policy.delay_for(retries);
        debug!(
            operation,
            retries,
            pending = unprocessed.len(),
            delay_ms = delay.as_millis() as u64,
            "Retrying unprocessed batch items"
        );
        tokio::time::sleep(delay).await;
        unprocessed = attempt_once(unprocessed).await?;
    }

    if !unprocessed.is_empty() {
        warn!(
            operation,
            abandoned = unprocessed.len(),
            retries,
            "Batch items still unprocessed after retries, giving up"
        );
    }

    Ok(BatchReport {
        retries,
        abandoned: unprocessed.len(),
    })
}

/// Write `jobs`, retrying only the unprocessed subset
pub async fn batch_put(
    store: &dyn JobStore,
    jobs: Vec<ImportJob>,
    policy: &RetryPolicy,
) -> ImportResult<BatchReport> {
    run_batch("batch_put", jobs, policy, |pending| async move {
        store.batch_write_raw(&pending).await
    })
    .await
}

/// Delete `keys`, retrying only the unprocessed subset
pub async fn batch_delete(
    store: &dyn JobStore,
    keys: Vec<JobKey>,
    policy: &RetryPolicy,
) -> ImportResult<BatchReport> {
    run_batch("batch_delete", keys, policy, |pending| async move {
        store.batch_delete_raw(&pending).await
    })
    .await
}

/// Fetch a job or fail with `JobNotFound`
pub async fn require(store: &dyn JobStore, key: &JobKey) -> ImportResult<ImportJob> {
    store
        .get(key)
        .await?
        .ok_or_else(|| ImportError::JobNotFound(key.id()))
}
