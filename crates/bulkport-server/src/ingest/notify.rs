//! Notification bridge
//!
//! Publishing side: every applied status transition goes through
//! [`StatusPublisher`], which writes the job and then emits an `import-status`
//! notification. A transition rejected by the terminal guard writes nothing and
//! publishes nothing, so duplicate finalization is silent.
//!
//! Consuming side: [`StatusConsumer`] watches for CSV master jobs reaching a
//! terminal status and resumes the orchestrator task that was paused on them, if a
//! callback token was stored on the job.

use async_trait::async_trait;
use bulkport_common::{ImportStatus, JobKey, JobKind, Notification};
use serde_json::{json, Value};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::model::{ImportJob, JobPatch};
use super::store::JobStore;
use super::workflow::WorkflowClient;
use crate::error::{ImportError, ImportResult};

/// Error code sent when a paused task's job failed
pub const IMPORT_FAILED_ERROR_CODE: &str = "ImportFailed";

#[async_trait]
pub trait NotificationBus: Send + Sync {
    async fn publish(&self, channel: &str, notification: &Notification) -> ImportResult<()>;
}

#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn handle(&self, notification: &Notification) -> ImportResult<()>;
}

/// `pg_notify` backed bus
#[derive(Clone)]
pub struct PgNotificationBus {
    pool: Arc<PgPool>,
}

impl PgNotificationBus {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NotificationBus for PgNotificationBus {
    async fn publish(&self, channel: &str, notification: &Notification) -> ImportResult<()> {
        let payload = serde_json::to_string(notification)?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(channel)
            .bind(payload)
            .execute(&*self.pool)
            .await
            .map_err(|e| ImportError::Bus(e.to_string()))?;
        Ok(())
    }
}

/// Listen on every channel in `handlers` and dispatch decoded notifications.
///
/// Handler errors are logged; undecodable payloads are skipped.
pub async fn spawn_pg_listener(
    pool: &PgPool,
    handlers: HashMap<String, Arc<dyn NotificationHandler>>,
) -> ImportResult<JoinHandle<()>> {
    let mut listener = PgListener::connect_with(pool).await?;
    let channels: Vec<&str> = handlers.keys().map(String::as_str).collect();
    listener.listen_all(channels).await?;

    info!(channels = ?handlers.keys().collect::<Vec<_>>(), "Listening for notifications");

    Ok(tokio::spawn(async move {
        loop {
            let message = match listener.recv().await {
                Ok(message) => message,
                Err(e) => {
                    error!(error = %e, "Notification listener failed");
                    break;
                },
            };

            let Some(handler) = handlers.get(message.channel()) else {
                continue;
            };

            match serde_json::from_str::<Notification>(message.payload()) {
                Ok(notification) => {
                    if let Err(e) = handler.handle(&notification).await {
                        error!(
                            channel = message.channel(),
                            job_key = %notification.job_key(),
                            error = %e,
                            "Notification handler failed"
                        );
                    }
                },
                Err(e) => warn!(channel = message.channel(), error = %e, "Skipping undecodable notification"),
            }
        }
    }))
}

/// Writes status changes and announces them
#[derive(Clone)]
pub struct StatusPublisher {
    store: Arc<dyn JobStore>,
    bus: Arc<dyn NotificationBus>,
    status_channel: String,
    alarm_channel: String,
}

impl StatusPublisher {
    pub fn new(
        store: Arc<dyn JobStore>,
        bus: Arc<dyn NotificationBus>,
        status_channel: impl Into<String>,
        alarm_channel: impl Into<String>,
    ) -> Self {
        Self {
            store,
            bus,
            status_channel: status_channel.into(),
            alarm_channel: alarm_channel.into(),
        }
    }

    /// Apply `patch`; when it carries a status and the write was applied, publish it.
    ///
    /// `Ok(None)` means the job was already terminal and nothing changed.
    #[instrument(skip(self, patch), fields(job_key = %key, status = ?patch.status))]
    pub async fn update(&self, key: &JobKey, patch: JobPatch) -> ImportResult<Option<ImportJob>> {
        let updated = self.store.update(key, &patch).await?;

        match (&updated, patch.status) {
            (Some(job), Some(status)) => self.announce(job, status).await,
            (None, Some(status)) => {
                debug!(%status, "Job already terminal, status not changed");
            },
            _ => {},
        }

        Ok(updated)
    }

    pub async fn set_status(
        &self,
        key: &JobKey,
        status: ImportStatus,
        result: Option<Value>,
    ) -> ImportResult<Option<ImportJob>> {
        let mut patch = JobPatch::status(status);
        patch.result = result;
        self.update(key, patch).await
    }

    /// Publish failures do not roll back the write that preceded them
    async fn announce(&self, job: &ImportJob, status: ImportStatus) {
        let notification = Notification::status_changed(&job.key(), status, job.result.clone());
        if let Err(e) = self.bus.publish(&self.status_channel, &notification).await {
            error!(job_key = %job.id, %status, error = %e, "Failed to publish status notification");
        }
    }

    pub async fn alarm(&self, key: &JobKey, error: Value) -> ImportResult<()> {
        warn!(job_key = %key, %error, "Publishing import alarm");
        self.bus
            .publish(&self.alarm_channel, &Notification::alarm(key, error))
            .await
    }
}

/// Resumes paused orchestrator tasks when the CSV master job they wait on finishes
#[derive(Clone)]
pub struct StatusConsumer {
    store: Arc<dyn JobStore>,
    workflow: Arc<dyn WorkflowClient>,
}

impl StatusConsumer {
    pub fn new(store: Arc<dyn JobStore>, workflow: Arc<dyn WorkflowClient>) -> Self {
        Self { store, workflow }
    }
}

#[async_trait]
impl NotificationHandler for StatusConsumer {
    async fn handle(&self, notification: &Notification) -> ImportResult<()> {
        let Some(status) = notification.import_status().filter(ImportStatus::is_terminal) else {
            return Ok(());
        };

        let key = notification.job_key();
        if key.kind() != Some(JobKind::CsvMaster) {
            return Ok(());
        }

        let Some(job) = self.store.get(&key).await? else {
            warn!(job_key = %key, "Job from status notification no longer exists");
            return Ok(());
        };

        let Some(token) = job.callback_token.as_deref() else {
            debug!(job_key = %key, "No callback token, nothing to resume");
            return Ok(());
        };

        let output = job.result.clone().unwrap_or_else(|| json!({}));
        match status {
            ImportStatus::Completed => {
                self.workflow.send_task_success(token, &output).await?;
            },
            _ => {
                let cause = serde_json::to_string(&output)?;
                self.workflow
                    .send_task_failure(token, IMPORT_FAILED_ERROR_CODE, &cause)
                    .await?;
            },
        }

        info!(job_key = %key, %status, "Resumed paused workflow task");
        Ok(())
    }
}
