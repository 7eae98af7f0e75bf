//! Pipeline stage dispatch
//!
//! The orchestrator calls back once per stage with `{stage, input, taskToken?}`.
//! CSV stages:
//!
//! - `loader`: counts the file's rows onto the master job, then returns the first
//!   batch (or the batch at `offset`).
//! - `mapper` (also used when no stage is named): turns a batch of parsed rows into
//!   child record jobs. One bad row fails the whole batch and nothing is written.
//! - `finalize`: records the number of rows the pipeline handled.
//!
//! ZIP stages `trigger-single-and-wait` and `finalize-zip` go to [`ZipBridge`].
//! Anything else is logged and answered with `null`.

use bulkport_common::JobKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{info, instrument, warn};

use super::counters::CounterAggregator;
use super::csv::CsvIngestor;
use super::model::{CreateCsvImportRequest, CreateImportRequest, RequestContext};
use super::service::ImportService;
use super::strategy::StrategyRegistry;
use super::zip_bridge::{FinalizeZipInput, TriggerInput, ZipBridge};
use crate::error::{ImportError, ImportResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Loader,
    Mapper,
    Finalize,
    TriggerSingleAndWait,
    FinalizeZip,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Loader => "loader",
            Stage::Mapper => "mapper",
            Stage::Finalize => "finalize",
            Stage::TriggerSingleAndWait => "trigger-single-and-wait",
            Stage::FinalizeZip => "finalize-zip",
        }
    }

    /// `None` names the default stage
    pub fn parse(name: Option<&str>) -> ImportResult<Self> {
        match name {
            None | Some("mapper") => Ok(Stage::Mapper),
            Some("loader") => Ok(Stage::Loader),
            Some("finalize") => Ok(Stage::Finalize),
            Some("trigger-single-and-wait") => Ok(Stage::TriggerSingleAndWait),
            Some("finalize-zip") => Ok(Stage::FinalizeZip),
            Some(other) => Err(ImportError::Orchestration(other.to_string())),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stage invocation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageRequest {
    #[serde(default)]
    pub stage: Option<String>,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_token: Option<String>,
}

/// CSV pipeline execution input: the submitted request plus the master job id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoaderInput {
    #[serde(flatten)]
    pub request: CreateCsvImportRequest,
    pub source_id: String,
    #[serde(default)]
    pub offset: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MapperAttributes {
    table_name: String,
    tenant_code: String,
    source_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchInput {
    attributes: MapperAttributes,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MapperInput {
    batch_input: BatchInput,
    #[serde(default)]
    items: Vec<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FinalizeInput {
    source_id: String,
    #[serde(default)]
    result_count: Option<i64>,
    #[serde(default)]
    map_result: Option<Vec<Value>>,
}

fn parse_input<T: DeserializeOwned>(stage: Stage, input: Value) -> ImportResult<T> {
    serde_json::from_value(input)
        .map_err(|e| ImportError::BadRequest(format!("Invalid {stage} input: {e}")))
}

#[derive(Clone)]
pub struct StageDispatcher {
    registry: Arc<StrategyRegistry>,
    service: ImportService,
    ingestor: CsvIngestor,
    counters: CounterAggregator,
    zip: ZipBridge,
    batch_limit: usize,
}

impl StageDispatcher {
    pub fn new(
        registry: Arc<StrategyRegistry>,
        service: ImportService,
        ingestor: CsvIngestor,
        counters: CounterAggregator,
        zip: ZipBridge,
        batch_limit: usize,
    ) -> Self {
        Self {
            registry,
            service,
            ingestor,
            counters,
            zip,
            batch_limit,
        }
    }

    #[instrument(skip(self, request), fields(stage = request.stage.as_deref().unwrap_or("mapper")))]
    pub async fn dispatch(&self, request: StageRequest) -> ImportResult<Value> {
        let stage = match Stage::parse(request.stage.as_deref()) {
            Ok(stage) => stage,
            Err(e) => {
                warn!(error = %e, "Ignoring unknown pipeline stage");
                return Ok(Value::Null);
            },
        };

        match stage {
            Stage::Loader => self.load(parse_input(stage, request.input)?).await,
            Stage::Mapper => self.map(parse_input(stage, request.input)?).await,
            Stage::Finalize => self.finalize(parse_input(stage, request.input)?).await,
            Stage::TriggerSingleAndWait => {
                let input: TriggerInput = parse_input(stage, request.input)?;
                self.zip
                    .trigger_single_and_wait(input, request.task_token.as_deref())
                    .await
            },
            Stage::FinalizeZip => self.zip.finalize_zip(parse_input(stage, request.input)?).await,
        }
    }

    async fn load(&self, input: LoaderInput) -> ImportResult<Value> {
        let master = JobKey::parse(&input.source_id)?;

        if input.offset == 0 {
            let total = self.ingestor.count_rows(&input.request.key).await?;
            let total = i64::try_from(total)
                .map_err(|_| ImportError::validation(format!("Row count out of range: {total}")))?;
            info!(job_key = %master, total, "Counted rows for master job");
            self.counters.learn_total_rows(&master, total).await?;
        }

        // Rows carry the execution input forward, minus the paging cursor
        let mut attributes = serde_json::to_value(&input)?;
        if let Some(map) = attributes.as_object_mut() {
            map.remove("offset");
        }

        let batch = self
            .ingestor
            .load_batch(&input.request.key, attributes, input.offset, self.batch_limit)
            .await?;

        Ok(json!({
            "batchInput": { "attributes": batch.attributes },
            "items": batch.items,
            "nextOffset": batch.next_offset,
        }))
    }

    async fn map(&self, input: MapperInput) -> ImportResult<Value> {
        let attributes = input.batch_input.attributes;
        let strategy = self.registry.import_strategy(&attributes.table_name)?;

        let mut mapped = Vec::with_capacity(input.items.len());
        for (index, item) in input.items.into_iter().enumerate() {
            let transformed = match strategy.transform(item).await {
                Ok(transformed) => transformed,
                Err(e) => {
                    warn!(row = index + 1, error = %e, "Row failed mapping");
                    return Err(e);
                },
            };
            if let Err(e) = strategy.validate(&transformed).await {
                warn!(row = index + 1, error = %e, "Row failed mapping");
                return Err(e);
            }
            mapped.push(transformed);
        }

        let context = RequestContext::system();
        let jobs = mapped
            .into_iter()
            .map(|attributes_for_row| {
                self.service.record_job(
                    CreateImportRequest {
                        tenant_code: attributes.tenant_code.clone(),
                        table_name: attributes.table_name.clone(),
                        name: None,
                        attributes: attributes_for_row,
                        source_id: Some(attributes.source_id.clone()),
                    },
                    &context,
                )
            })
            .collect::<ImportResult<Vec<_>>>()?;

        let created = self.service.submit_all(jobs).await?;
        info!(master = %attributes.source_id, created = created.len(), "Created child import jobs");
        Ok(json!({ "created": created.len() }))
    }

    async fn finalize(&self, input: FinalizeInput) -> ImportResult<Value> {
        let master = JobKey::parse(&input.source_id)?;
        let total = input
            .result_count
            .or_else(|| input.map_result.as_ref().map(|r| r.len() as i64))
            .ok_or_else(|| {
                ImportError::BadRequest(format!(
                    "finalize input for {} carries neither resultCount nor mapResult",
                    input.source_id
                ))
            })?;

        info!(job_key = %master, total, "Setting total rows from pipeline result");
        let job = self.counters.learn_total_rows(&master, total).await?;

        Ok(json!({
            "jobKey": job.id,
            "status": job.status,
            "totalRows": job.total_rows,
            "processedRows": job.processed_rows,
        }))
    }
}
