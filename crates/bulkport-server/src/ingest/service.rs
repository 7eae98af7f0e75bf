//! Job submission
//!
//! Creates job records and hands them to the queue. Single-record imports go
//! through the entity's import strategy first, so an unknown entity type or
//! invalid payload is rejected before anything is written.

use bulkport_common::{ImportStatus, JobKey, JobKind};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

use super::csv::CsvIngestor;
use super::model::{
    file_name, new_job_id, CreateCsvImportRequest, CreateImportRequest, CreateZipImportRequest,
    ImportJob, NewImportJob, ProcessingMode, RequestContext,
};
use super::notify::StatusPublisher;
use super::queue::{ImportQueueMessage, JobQueue};
use super::store::{batch_delete, batch_put, require, BatchReport, JobStore, RetryPolicy};
use super::strategy::StrategyRegistry;
use crate::error::ImportResult;

/// What `handle_csv_import` produced
#[derive(Debug, Clone)]
pub enum CsvImportOutcome {
    /// One record job per valid row
    Records(Vec<ImportJob>),
    /// Master job left for the orchestrator
    Master(ImportJob),
}

#[derive(Clone)]
pub struct ImportService {
    store: Arc<dyn JobStore>,
    registry: Arc<StrategyRegistry>,
    queue: Arc<dyn JobQueue>,
    publisher: StatusPublisher,
    ingestor: CsvIngestor,
    retry: RetryPolicy,
}

impl ImportService {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<StrategyRegistry>,
        queue: Arc<dyn JobQueue>,
        publisher: StatusPublisher,
        ingestor: CsvIngestor,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            publisher,
            ingestor,
            retry,
        }
    }

    /// Transform, validate, persist and enqueue a single-record import
    #[instrument(skip(self, request, context), fields(table = %request.table_name, tenant = %request.tenant_code))]
    pub async fn create_with_api(
        &self,
        request: CreateImportRequest,
        context: &RequestContext,
    ) -> ImportResult<ImportJob> {
        let strategy = self.registry.import_strategy(&request.table_name)?;

        let attributes = strategy.transform(request.attributes.clone()).await?;
        strategy.validate(&attributes).await?;

        let job = self
            .create_import(
                CreateImportRequest {
                    attributes,
                    ..request
                },
                context,
            )
            .await?;
        self.submit(&job).await
    }

    /// Persist a record job without running strategies.
    ///
    /// With a `source_id` the job becomes a child of that master and its sort key
    /// embeds the master's key.
    pub async fn create_import(
        &self,
        request: CreateImportRequest,
        context: &RequestContext,
    ) -> ImportResult<ImportJob> {
        let job = self.record_job(request, context)?;
        self.store.put(&job).await?;
        debug!(job_key = %job.id, "Created import job");
        Ok(job)
    }

    /// Build, without persisting, the record job for `request`
    pub fn record_job(
        &self,
        request: CreateImportRequest,
        context: &RequestContext,
    ) -> ImportResult<ImportJob> {
        let code = new_job_id();
        let parent = request
            .source_id
            .as_deref()
            .map(JobKey::parse)
            .transpose()?;
        let sort_key = match &parent {
            Some(parent) => parent.child_sort_key(&code),
            None => format!("{}#{code}", request.table_name),
        };

        Ok(ImportJob::new(NewImportJob {
            key: JobKey::new(JobKind::Record.partition_key(&request.tenant_code), sort_key),
            name: request.name.unwrap_or_else(|| request.table_name.clone()),
            code,
            entity_type: request.table_name,
            attributes: request.attributes,
            parent_key: parent,
            callback_token: None,
            context: context.clone(),
        }))
    }

    /// Route a CSV upload by its processing mode
    #[instrument(skip(self, request, context), fields(key = %request.key, mode = ?request.processing_mode))]
    pub async fn handle_csv_import(
        &self,
        request: CreateCsvImportRequest,
        context: &RequestContext,
    ) -> ImportResult<CsvImportOutcome> {
        match request.processing_mode {
            ProcessingMode::Direct => self
                .process_csv_directly(request, context)
                .await
                .map(CsvImportOutcome::Records),
            ProcessingMode::Workflow => {
                let job = self.create_csv_job(request, context).await?;
                let job = self.submit(&job).await?;
                Ok(CsvImportOutcome::Master(job))
            },
        }
    }

    /// Persist a CSV master job
    pub async fn create_csv_job(
        &self,
        request: CreateCsvImportRequest,
        context: &RequestContext,
    ) -> ImportResult<ImportJob> {
        self.put_csv_master(request, context, None, None).await
    }

    /// Persist a CSV master job spawned by a ZIP job, carrying the token of the
    /// orchestrator task waiting on it
    pub async fn create_csv_job_with_token(
        &self,
        request: CreateCsvImportRequest,
        token: &str,
        parent: &JobKey,
    ) -> ImportResult<ImportJob> {
        let context = RequestContext {
            request_id: Some(new_job_id()),
            ..RequestContext::system()
        };
        self.put_csv_master(request, &context, Some(token.to_string()), Some(parent.clone()))
            .await
    }

    async fn put_csv_master(
        &self,
        request: CreateCsvImportRequest,
        context: &RequestContext,
        callback_token: Option<String>,
        parent: Option<JobKey>,
    ) -> ImportResult<ImportJob> {
        let code = new_job_id();
        let key = JobKey::new(
            JobKind::CsvMaster.partition_key(&request.tenant_code),
            format!("{}#{code}", request.table_name),
        );

        let job = ImportJob::new(NewImportJob {
            key,
            name: file_name(&request.key).to_string(),
            code,
            entity_type: request.table_name.clone(),
            attributes: serde_json::to_value(&request)?,
            parent_key: parent,
            callback_token,
            context: context.clone(),
        });

        self.store.put(&job).await?;
        info!(job_key = %job.id, file = %request.key, "Created CSV import job");
        Ok(job)
    }

    /// Persist a ZIP master job
    pub async fn create_zip_job(
        &self,
        request: CreateZipImportRequest,
        context: &RequestContext,
    ) -> ImportResult<ImportJob> {
        let code = new_job_id();
        let key = JobKey::new(
            JobKind::ZipMaster.partition_key(&request.tenant_code),
            format!("ZIP#{code}"),
        );

        let job = ImportJob::new(NewImportJob {
            key,
            name: file_name(&request.key).to_string(),
            code,
            entity_type: request.table_name.clone().unwrap_or_default(),
            attributes: serde_json::to_value(&request)?,
            parent_key: None,
            callback_token: None,
            context: context.clone(),
        });

        self.store.put(&job).await?;
        info!(job_key = %job.id, file = %request.key, "Created ZIP import job");
        Ok(job)
    }

    /// Mark `job` queued, then enqueue the queued snapshot.
    ///
    /// A job that is already terminal is returned as stored and never enqueued. If
    /// the enqueue fails the job is marked failed with the error as its result.
    pub async fn submit(&self, job: &ImportJob) -> ImportResult<ImportJob> {
        let key = job.key();
        let Some(queued) = self
            .publisher
            .set_status(&key, ImportStatus::Queued, None)
            .await?
        else {
            warn!(job_key = %key, "Job already terminal, not enqueued");
            return require(self.store.as_ref(), &key).await;
        };

        if let Err(e) = self.queue.enqueue(ImportQueueMessage::new(queued.clone())).await {
            error!(job_key = %key, error = %e, "Failed to enqueue import job");
            self.publisher
                .set_status(&key, ImportStatus::Failed, Some(e.to_json()))
                .await?;
            return Err(e);
        }
        Ok(queued)
    }

    /// Persist `jobs` in one best-effort batch, then enqueue each one
    pub async fn submit_all(&self, jobs: Vec<ImportJob>) -> ImportResult<Vec<ImportJob>> {
        if jobs.is_empty() {
            return Ok(jobs);
        }

        let report = batch_put(self.store.as_ref(), jobs.clone(), &self.retry).await?;
        if report.abandoned > 0 {
            warn!(abandoned = report.abandoned, "Some import jobs could not be written");
        }

        let mut submitted = Vec::with_capacity(jobs.len());
        for job in jobs {
            if self.store.get(&job.key()).await?.is_none() {
                continue;
            }
            submitted.push(self.submit(&job).await?);
        }
        Ok(submitted)
    }

    pub async fn get_job(&self, key: &JobKey) -> ImportResult<ImportJob> {
        require(self.store.as_ref(), key).await
    }

    /// Remove every child record of `master`
    pub async fn purge_children(&self, master: &JobKey) -> ImportResult<BatchReport> {
        let keys: Vec<JobKey> = self
            .store
            .list_children(master)
            .await?
            .iter()
            .map(ImportJob::key)
            .collect();

        info!(job_key = %master, children = keys.len(), "Purging child jobs");
        batch_delete(self.store.as_ref(), keys, &self.retry).await
    }

    /// Stream the whole file, creating one record job per valid row.
    ///
    /// Rows that fail transform or validate are logged and skipped.
    async fn process_csv_directly(
        &self,
        request: CreateCsvImportRequest,
        context: &RequestContext,
    ) -> ImportResult<Vec<ImportJob>> {
        let strategy = self.registry.import_strategy(&request.table_name)?;
        let mut reader = self.ingestor.open(&request.key).await?;

        let mut jobs = Vec::new();
        let mut line = 0_usize;
        while let Some(row) = reader.next_row().await? {
            line += 1;
            let attributes = match strategy.transform(Value::Object(row)).await {
                Ok(attributes) => attributes,
                Err(e) => {
                    warn!(row = line, error = %e, "Skipping CSV row");
                    continue;
                },
            };
            if let Err(e) = strategy.validate(&attributes).await {
                warn!(row = line, error = %e, "Skipping CSV row");
                continue;
            }

            jobs.push(self.record_job(
                CreateImportRequest {
                    tenant_code: request.tenant_code.clone(),
                    table_name: request.table_name.clone(),
                    name: None,
                    attributes,
                    source_id: None,
                },
                context,
            )?);
        }

        info!(rows = line, created = jobs.len(), "Finished direct CSV import");
        self.submit_all(jobs).await
    }
}
