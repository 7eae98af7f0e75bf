//! Atomic counter aggregation for master jobs
//!
//! Children report to their master one at a time and in any order, possibly before
//! the master's total is known. Counters are only ever changed by single atomic
//! store writes, and both the increment path and the learn-total path check whether
//! the master is done. Finalization goes through the status guard, so whichever path
//! gets there second is a no-op.

use bulkport_common::{ImportStatus, JobKey, JobKind};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use super::model::{ImportJob, Outcome, RowTotals};
use super::notify::StatusPublisher;
use super::store::{JobStore, RetryPolicy};
use crate::error::ImportResult;

pub const CHILDREN_PROCESSED_MESSAGE: &str = "All child jobs have been processed.";

/// Result stored on a finalized master job
pub fn summary(totals: &RowTotals) -> Value {
    json!({
        "message": CHILDREN_PROCESSED_MESSAGE,
        "total": totals.total,
        "succeeded": totals.succeeded,
        "failed": totals.failed,
    })
}

#[derive(Clone)]
pub struct CounterAggregator {
    store: Arc<dyn JobStore>,
    publisher: StatusPublisher,
    retry: RetryPolicy,
}

impl CounterAggregator {
    pub fn new(store: Arc<dyn JobStore>, publisher: StatusPublisher, retry: RetryPolicy) -> Self {
        Self {
            store,
            publisher,
            retry,
        }
    }

    /// Count one finished child against `key` and finalize if it was the last one
    #[instrument(skip(self), fields(job_key = %key))]
    pub async fn increment(&self, key: &JobKey, outcome: Outcome) -> ImportResult<ImportJob> {
        let job = self
            .retry
            .retry_conditional(|| self.store.increment_counters(key, outcome))
            .await?;

        debug!(
            total = job.total_rows,
            processed = job.processed_rows,
            succeeded = job.succeeded_rows,
            failed = job.failed_rows,
            "Incremented job counters"
        );

        if job.total_rows > 0 && job.processed_rows >= job.total_rows {
            return self.finalize(&job).await;
        }
        Ok(job)
    }

    /// Count `child` against its CSV master, if it has one
    pub async fn report_child(&self, child: &ImportJob, outcome: Outcome) -> ImportResult<Option<ImportJob>> {
        let Some(parent) = child.parent().filter(|p| p.kind() == Some(JobKind::CsvMaster)) else {
            return Ok(None);
        };
        self.increment(&parent, outcome).await.map(Some)
    }

    /// Record the master's row count.
    ///
    /// Children may already have reported, so this checks for completion too. A total
    /// of zero finalizes straight away only while no child has reported.
    #[instrument(skip(self), fields(job_key = %key))]
    pub async fn learn_total_rows(&self, key: &JobKey, total_rows: i64) -> ImportResult<ImportJob> {
        let job = self
            .retry
            .retry_conditional(|| self.store.set_total_rows(key, total_rows))
            .await?;

        debug!(total = total_rows, processed = job.processed_rows, "Learned total rows");

        let complete = match job.total_rows {
            0 => job.processed_rows == 0,
            total => total > 0 && job.processed_rows >= total,
        };
        if complete {
            return self.finalize(&job).await;
        }
        Ok(job)
    }

    /// Overwrite every counter with aggregated totals and finalize
    #[instrument(skip(self), fields(job_key = %key))]
    pub async fn settle(&self, key: &JobKey, totals: RowTotals) -> ImportResult<ImportJob> {
        let job = self
            .retry
            .retry_conditional(|| self.store.record_totals(key, totals))
            .await?;
        self.finalize(&job).await
    }

    /// Move `job` to its terminal status. Returns the stored job unchanged when it
    /// was already terminal.
    pub async fn finalize(&self, job: &ImportJob) -> ImportResult<ImportJob> {
        let key = job.key();
        if job.status.is_terminal() {
            debug!(job_key = %key, status = %job.status, "Already finalized");
            return Ok(job.clone());
        }

        let totals = job.totals();
        let status = ImportStatus::for_outcome(totals.failed);

        match self
            .publisher
            .set_status(&key, status, Some(summary(&totals)))
            .await?
        {
            Some(updated) => {
                info!(
                    job_key = %key,
                    %status,
                    total = totals.total,
                    succeeded = totals.succeeded,
                    failed = totals.failed,
                    "Finalized job"
                );
                Ok(updated)
            },
            None => {
                debug!(job_key = %key, "Finalized concurrently by another caller");
                Ok(job.clone())
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::memory::{MemoryBus, MemoryJobStore};
    use crate::ingest::model::{NewImportJob, RequestContext};

    const STATUS: &str = "import_status";

    struct Fixture {
        store: Arc<MemoryJobStore>,
        bus: Arc<MemoryBus>,
        counters: CounterAggregator,
        key: JobKey,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryJobStore::new());
        let bus = Arc::new(MemoryBus::new());
        let publisher = StatusPublisher::new(store.clone(), bus.clone(), STATUS, "import_alarm");
        let counters = CounterAggregator::new(store.clone(), publisher, RetryPolicy::default());

        let key = JobKey::new("CSV_IMPORT#acme", "widgets#01J");
        store
            .put(&ImportJob::new(NewImportJob {
                key: key.clone(),
                code: "widgets.csv".into(),
                name: "widgets.csv".into(),
                entity_type: "widgets".into(),
                attributes: json!({}),
                parent_key: None,
                callback_token: None,
                context: RequestContext::default(),
            }))
            .await
            .unwrap();

        Fixture {
            store,
            bus,
            counters,
            key,
        }
    }

    #[tokio::test]
    async fn test_increment_without_total_does_not_finalize() {
        let f = fixture().await;
        let job = f.counters.increment(&f.key, Outcome::Succeeded).await.unwrap();
        assert_eq!(job.processed_rows, 1);
        assert_eq!(job.status, ImportStatus::Created);
        assert!(f.bus.published(STATUS).is_empty());
    }

    #[tokio::test]
    async fn test_last_increment_finalizes_failed() {
        let f = fixture().await;
        f.counters.learn_total_rows(&f.key, 2).await.unwrap();
        f.counters.increment(&f.key, Outcome::Succeeded).await.unwrap();
        let job = f.counters.increment(&f.key, Outcome::Failed).await.unwrap();

        assert_eq!(job.status, ImportStatus::Failed);
        assert_eq!(
            job.result,
            Some(json!({"message": CHILDREN_PROCESSED_MESSAGE, "total": 2, "succeeded": 1, "failed": 1}))
        );
    }

    #[tokio::test]
    async fn test_total_learned_after_children() {
        let f = fixture().await;
        f.counters.increment(&f.key, Outcome::Succeeded).await.unwrap();
        f.counters.increment(&f.key, Outcome::Succeeded).await.unwrap();

        let job = f.counters.learn_total_rows(&f.key, 2).await.unwrap();
        assert_eq!(job.status, ImportStatus::Completed);
    }

    #[tokio::test]
    async fn test_zero_total_finalizes_immediately() {
        let f = fixture().await;
        let job = f.counters.learn_total_rows(&f.key, 0).await.unwrap();
        assert_eq!(job.status, ImportStatus::Completed);
        assert_eq!(job.result.unwrap()["total"], 0);
    }

    #[tokio::test]
    async fn test_zero_total_after_children_reported_waits() {
        let f = fixture().await;
        f.counters.learn_total_rows(&f.key, 3).await.unwrap();
        f.counters.increment(&f.key, Outcome::Succeeded).await.unwrap();

        let job = f.counters.learn_total_rows(&f.key, 0).await.unwrap();
        assert_eq!(job.status, ImportStatus::Created);
        assert_eq!(job.processed_rows, 1);
        assert!(f.bus.published(STATUS).is_empty());
    }

    #[tokio::test]
    async fn test_counters_frozen_once_terminal() {
        let f = fixture().await;
        f.counters.learn_total_rows(&f.key, 2).await.unwrap();
        f.counters.increment(&f.key, Outcome::Succeeded).await.unwrap();
        let done = f.counters.increment(&f.key, Outcome::Succeeded).await.unwrap();
        assert_eq!(done.status, ImportStatus::Completed);

        let relearned = f.counters.learn_total_rows(&f.key, 5).await.unwrap();
        let settled = f
            .counters
            .settle(&f.key, RowTotals { total: 4, processed: 4, succeeded: 0, failed: 4 })
            .await
            .unwrap();

        for job in [relearned, settled] {
            assert_eq!(job.status, ImportStatus::Completed);
            assert_eq!((job.total_rows, job.processed_rows), (2, 2));
            assert_eq!((job.succeeded_rows, job.failed_rows), (2, 0));
        }
        assert_eq!(f.bus.statuses_for(STATUS, &f.key), vec![ImportStatus::Completed]);
    }

    #[tokio::test]
    async fn test_double_finalize_is_silent() {
        let f = fixture().await;
        f.counters.learn_total_rows(&f.key, 1).await.unwrap();
        f.counters.increment(&f.key, Outcome::Failed).await.unwrap();
        let before = f.store.get(&f.key).await.unwrap().unwrap();

        let again = f.counters.finalize(&before).await.unwrap();
        let stale = ImportJob {
            status: ImportStatus::Processing,
            ..before.clone()
        };
        f.counters.finalize(&stale).await.unwrap();

        assert_eq!(again, before);
        assert_eq!(f.store.get(&f.key).await.unwrap().unwrap(), before);
        assert_eq!(f.bus.statuses_for(STATUS, &f.key), vec![ImportStatus::Failed]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_children_with_total_learned_midway() {
        let f = fixture().await;
        let (succeeding, failing) = (40_i64, 13_i64);

        let mut tasks = Vec::new();
        for i in 0..(succeeding + failing) {
            let counters = f.counters.clone();
            let key = f.key.clone();
            tasks.push(tokio::spawn(async move {
                let outcome = Outcome::from_success(i < succeeding);
                counters.increment(&key, outcome).await.unwrap();
            }));
            if i == 20 {
                let counters = f.counters.clone();
                let key = f.key.clone();
                tasks.push(tokio::spawn(async move {
                    counters.learn_total_rows(&key, succeeding + failing).await.unwrap();
                }));
            }
        }
        futures::future::join_all(tasks).await;

        let job = f.store.get(&f.key).await.unwrap().unwrap();
        assert_eq!(job.processed_rows, succeeding + failing);
        assert_eq!(job.succeeded_rows, succeeding);
        assert_eq!(job.failed_rows, failing);
        assert_eq!(job.status, ImportStatus::Failed);
        assert_eq!(f.bus.statuses_for(STATUS, &f.key), vec![ImportStatus::Failed]);
    }
}
