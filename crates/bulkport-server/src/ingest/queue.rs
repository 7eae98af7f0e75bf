//! Job queue
//!
//! Submitted jobs are enqueued as `{jobKey, job}` envelopes and consumed one at a
//! time by [`QueueRouter`](super::worker::QueueRouter). Production uses apalis on
//! PostgreSQL; delivery is at-least-once.

use anyhow::Result;
use apalis::prelude::*;
use apalis_postgres::PostgresStorage;
use async_trait::async_trait;
use bulkport_common::JobKey;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::model::ImportJob;
use super::worker::QueueRouter;
use crate::error::{ImportError, ImportResult};

/// Queue envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportQueueMessage {
    pub job_key: JobKey,
    /// Job as it was when enqueued
    pub job: ImportJob,
}

impl ImportQueueMessage {
    pub fn new(job: ImportJob) -> Self {
        Self {
            job_key: job.key(),
            job,
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, message: ImportQueueMessage) -> ImportResult<()>;
}

/// apalis queue backed by PostgreSQL
#[derive(Clone)]
pub struct ApalisQueue {
    storage: PostgresStorage<ImportQueueMessage>,
}

impl ApalisQueue {
    pub fn new(pool: &PgPool) -> Self {
        Self {
            storage: PostgresStorage::new(pool),
        }
    }

    /// Spawn the worker that drains the queue into `router`
    pub fn start_worker(&self, router: Arc<QueueRouter>) -> JoinHandle<()> {
        let storage = self.storage.clone();

        tokio::spawn(async move {
            info!("Import queue worker started");
            if let Err(e) = Monitor::new()
                .register(move |_index| {
                    WorkerBuilder::new("bulkport-import-worker")
                        .backend(storage.clone())
                        .data(router.clone())
                        .build(process_import_message)
                })
                .run()
                .await
            {
                error!("Import queue worker error: {:?}", e);
            }
            info!("Import queue worker stopped");
        })
    }
}

#[async_trait]
impl JobQueue for ApalisQueue {
    async fn enqueue(&self, message: ImportQueueMessage) -> ImportResult<()> {
        let mut storage = self.storage.clone();
        let key = message.job_key.id();
        storage
            .push(message)
            .await
            .map_err(|e| ImportError::Queue(format!("Failed to enqueue {key}: {e}")))?;
        debug!(job_key = %key, "Enqueued import job");
        Ok(())
    }
}

/// apalis handler. Failures returned here are recorded by apalis for retry.
async fn process_import_message(
    message: ImportQueueMessage,
    router: Data<Arc<QueueRouter>>,
) -> Result<()> {
    router.route(&message).await?;
    Ok(())
}
