//! Queue consumers
//!
//! [`QueueRouter`] receives every queued job and hands it to the handler for its
//! kind. Record jobs never fail back to the queue: any error becomes a `FAILED`
//! status, an alarm and a failed count on the parent. The master starters do
//! report errors back so the queue records them, after marking the job `FAILED`.

use async_trait::async_trait;
use bulkport_common::{ImportStatus, JobKey, JobKind, Notification, NotificationAction};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::archive::ZipExtractor;
use super::counters::CounterAggregator;
use super::model::{CreateZipImportRequest, ImportJob, JobPatch, Outcome};
use super::notify::{NotificationHandler, StatusPublisher};
use super::queue::ImportQueueMessage;
use super::store::JobStore;
use super::strategy::{CommandReceipt, ComparisonStatus, StrategyRegistry};
use super::workflow::WorkflowClient;
use super::zip_bridge::ZipParameters;
use crate::error::{ImportError, ImportResult};

pub const NO_CHANGES_MESSAGE: &str = "No changes detected.";

/// Command status reported when a sink finished a write
pub const COMMAND_FINISHED: &str = "FINISH:FINISHED";
/// Command status reported when a sink gave up on a write
pub const COMMAND_FAILED: &str = "FINISH:FAILED";

/// Current state of a queued job, or `None` if it should not be handled again
async fn fresh_job(
    store: &dyn JobStore,
    key: &JobKey,
    startable: fn(ImportStatus) -> bool,
) -> ImportResult<Option<ImportJob>> {
    match store.get(key).await? {
        Some(job) if startable(job.status) => Ok(Some(job)),
        Some(job) => {
            debug!(job_key = %key, status = %job.status, "Skipping redelivered job");
            Ok(None)
        },
        None => {
            warn!(job_key = %key, "Queued job no longer exists");
            Ok(None)
        },
    }
}

fn not_started(status: ImportStatus) -> bool {
    matches!(status, ImportStatus::Created | ImportStatus::Queued)
}

fn not_terminal(status: ImportStatus) -> bool {
    !status.is_terminal()
}

/// Processes one record job
#[derive(Clone)]
pub struct RecordWorker {
    store: Arc<dyn JobStore>,
    registry: Arc<StrategyRegistry>,
    publisher: StatusPublisher,
    counters: CounterAggregator,
}

impl RecordWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<StrategyRegistry>,
        publisher: StatusPublisher,
        counters: CounterAggregator,
    ) -> Self {
        Self {
            store,
            registry,
            publisher,
            counters,
        }
    }

    /// Never fails; errors are recorded on the job instead
    #[instrument(skip(self, message), fields(job_key = %message.job_key))]
    pub async fn handle(&self, message: &ImportQueueMessage) {
        let job = match fresh_job(self.store.as_ref(), &message.job_key, not_terminal).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            // Fall back to the snapshot so the failure can still be recorded
            Err(e) => {
                self.fail(&message.job, e).await;
                return;
            },
        };

        if let Err(e) = self.process(&job).await {
            self.fail(&job, e).await;
        }
    }

    async fn process(&self, job: &ImportJob) -> ImportResult<()> {
        let key = job.key();
        let strategy = self.registry.process_strategy(&job.entity_type)?;

        self.publisher
            .set_status(&key, ImportStatus::Processing, None)
            .await?;

        let tenant = job.tenant();
        let comparison = strategy.compare(&job.attributes, &tenant).await?;

        if comparison.status == ComparisonStatus::Equal {
            info!("No changes, completing without a write");
            let result = json!({ "status": ComparisonStatus::Equal.as_str(), "message": NO_CHANGES_MESSAGE });
            return self.complete(job, result).await;
        }

        let payload = strategy
            .map(comparison.status, &job.attributes, &tenant, comparison.existing.as_ref())
            .await?;

        match strategy.command_sink().submit(&key, payload).await? {
            CommandReceipt::Settled(output) => self.complete(job, output).await,
            CommandReceipt::Pending { command_id } => {
                info!(%command_id, "Write accepted, waiting for command status");
                self.publisher
                    .update(
                        &key,
                        JobPatch {
                            result: Some(json!({ "commandId": command_id })),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(())
            },
        }
    }

    async fn complete(&self, job: &ImportJob, result: Value) -> ImportResult<()> {
        let applied = self
            .publisher
            .set_status(&job.key(), ImportStatus::Completed, Some(result))
            .await?;

        if applied.is_some() {
            self.counters.report_child(job, Outcome::Succeeded).await?;
        }
        Ok(())
    }

    async fn fail(&self, job: &ImportJob, err: ImportError) {
        let key = job.key();
        error!(job_key = %key, error = %err, "Import job failed");
        let detail = err.to_json();

        let applied = match self
            .publisher
            .set_status(&key, ImportStatus::Failed, Some(detail.clone()))
            .await
        {
            Ok(applied) => applied.is_some(),
            Err(e) => {
                error!(job_key = %key, error = %e, "Could not mark job failed");
                false
            },
        };

        if let Err(e) = self.publisher.alarm(&key, detail).await {
            error!(job_key = %key, error = %e, "Could not publish alarm");
        }

        if applied {
            if let Err(e) = self.counters.report_child(job, Outcome::Failed).await {
                error!(job_key = %key, error = %e, "Could not update parent counters");
            }
        }
    }
}

/// Starts the CSV pipeline for a CSV master job
#[derive(Clone)]
pub struct CsvMasterHandler {
    store: Arc<dyn JobStore>,
    registry: Arc<StrategyRegistry>,
    publisher: StatusPublisher,
    workflow: Arc<dyn WorkflowClient>,
    pipeline: String,
}

impl CsvMasterHandler {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<StrategyRegistry>,
        publisher: StatusPublisher,
        workflow: Arc<dyn WorkflowClient>,
        pipeline: impl Into<String>,
    ) -> Self {
        Self {
            store,
            registry,
            publisher,
            workflow,
            pipeline: pipeline.into(),
        }
    }

    #[instrument(skip(self, message), fields(job_key = %message.job_key))]
    pub async fn handle(&self, message: &ImportQueueMessage) -> ImportResult<()> {
        let Some(job) = fresh_job(self.store.as_ref(), &message.job_key, not_started).await? else {
            return Ok(());
        };
        let key = job.key();

        info!(file = job.attribute("key").unwrap_or_default(), "Starting CSV import");
        self.publisher
            .set_status(&key, ImportStatus::Processing, None)
            .await?;

        if let Err(e) = self.start(&job).await {
            let result = json!({ "message": format!("Failed to start workflow: {e}") });
            self.publisher
                .set_status(&key, ImportStatus::Failed, Some(result))
                .await?;
            return Err(e);
        }
        Ok(())
    }

    async fn start(&self, job: &ImportJob) -> ImportResult<()> {
        self.registry.get(&job.entity_type)?;

        let mut input = job.attributes.clone();
        match input.as_object_mut() {
            Some(map) => {
                map.insert("sourceId".to_string(), Value::String(job.id.clone()));
            },
            None => {
                return Err(ImportError::BadRequest(format!(
                    "CSV job {} has no request attributes",
                    job.id
                )))
            },
        }

        let execution = self
            .workflow
            .start_execution(&self.pipeline, &job.key().sanitized_id(), &input)
            .await?;
        info!(%execution, "Started CSV pipeline");
        Ok(())
    }
}

/// Extracts a ZIP archive and starts the ZIP pipeline over its CSV files
#[derive(Clone)]
pub struct ZipMasterHandler {
    store: Arc<dyn JobStore>,
    publisher: StatusPublisher,
    extractor: ZipExtractor,
    workflow: Arc<dyn WorkflowClient>,
    pipeline: String,
}

impl ZipMasterHandler {
    pub fn new(
        store: Arc<dyn JobStore>,
        publisher: StatusPublisher,
        extractor: ZipExtractor,
        workflow: Arc<dyn WorkflowClient>,
        pipeline: impl Into<String>,
    ) -> Self {
        Self {
            store,
            publisher,
            extractor,
            workflow,
            pipeline: pipeline.into(),
        }
    }

    #[instrument(skip(self, message), fields(job_key = %message.job_key))]
    pub async fn handle(&self, message: &ImportQueueMessage) -> ImportResult<()> {
        let Some(job) = fresh_job(self.store.as_ref(), &message.job_key, not_started).await? else {
            return Ok(());
        };
        let key = job.key();

        if let Err(e) = self.start(&job).await {
            error!(error = %e, "ZIP import preparation failed");
            let result = json!({ "message": format!("Failed during unzip and preparation: {e}") });
            self.publisher
                .set_status(&key, ImportStatus::Failed, Some(result))
                .await?;
            return Err(e);
        }
        Ok(())
    }

    async fn start(&self, job: &ImportJob) -> ImportResult<()> {
        let key = job.key();
        let request: CreateZipImportRequest = serde_json::from_value(job.attributes.clone())?;
        info!(file = %request.key, "Starting ZIP import");

        self.publisher
            .update(
                &key,
                JobPatch::status(ImportStatus::Processing).with_attribute("step", json!("Unzipping archive")),
            )
            .await?;

        let keys = self.extractor.extract(&request.key, &key).await?;

        self.publisher
            .update(
                &key,
                JobPatch::default().with_attribute("extractedFileKeys", json!(keys)),
            )
            .await?;

        let input = json!({
            "masterJobKey": key,
            "sortedKeys": keys,
            "parameters": ZipParameters {
                bucket: request.bucket,
                tenant_code: request.tenant_code,
                table_name: request.table_name,
            },
        });

        let execution = self
            .workflow
            .start_execution(&self.pipeline, &key.sanitized_id(), &input)
            .await?;
        info!(%execution, files = keys.len(), "Started ZIP pipeline");
        Ok(())
    }
}

/// Settles record jobs whose write a command sink finished asynchronously
#[derive(Clone)]
pub struct CommandStatusConsumer {
    publisher: StatusPublisher,
    counters: CounterAggregator,
}

impl CommandStatusConsumer {
    pub fn new(publisher: StatusPublisher, counters: CounterAggregator) -> Self {
        Self {
            publisher,
            counters,
        }
    }

    fn import_status(command_status: &str) -> Option<ImportStatus> {
        match command_status {
            COMMAND_FINISHED => Some(ImportStatus::Completed),
            COMMAND_FAILED => Some(ImportStatus::Failed),
            _ => None,
        }
    }
}

#[async_trait]
impl NotificationHandler for CommandStatusConsumer {
    async fn handle(&self, notification: &Notification) -> ImportResult<()> {
        if notification.action != NotificationAction::CommandStatus {
            return Ok(());
        }
        let content = &notification.content;

        let Some(source) = content.source.as_deref() else {
            return Ok(());
        };
        let key = JobKey::parse(source)?;
        if key.kind() != Some(JobKind::Record) {
            debug!(%source, "Ignoring command status from non-import source");
            return Ok(());
        }

        let Some(status) = content.status.as_deref().and_then(Self::import_status) else {
            debug!(%source, status = ?content.status, "Ignoring intermediate command status");
            return Ok(());
        };

        info!(job_key = %key, %status, "Command settled");
        let payload = content.result.clone().or_else(|| content.error.clone());
        let Some(job) = self.publisher.set_status(&key, status, payload).await? else {
            return Ok(());
        };

        let outcome = Outcome::from_success(status == ImportStatus::Completed);
        self.counters.report_child(&job, outcome).await?;
        Ok(())
    }
}

/// Sends each queued job to the handler for its kind
#[derive(Clone)]
pub struct QueueRouter {
    record: RecordWorker,
    csv: CsvMasterHandler,
    zip: ZipMasterHandler,
}

impl QueueRouter {
    pub fn new(record: RecordWorker, csv: CsvMasterHandler, zip: ZipMasterHandler) -> Self {
        Self { record, csv, zip }
    }

    pub async fn route(&self, message: &ImportQueueMessage) -> ImportResult<()> {
        match message.job_key.kind() {
            Some(JobKind::Record) => {
                self.record.handle(message).await;
                Ok(())
            },
            Some(JobKind::CsvMaster) => self.csv.handle(message).await,
            Some(JobKind::ZipMaster) => self.zip.handle(message).await,
            None => {
                warn!(job_key = %message.job_key, "Dropping queued job of unknown kind");
                Ok(())
            },
        }
    }
}
