//! Test helpers for Bulkport integration tests
//!
//! Builds an [`ImportEngine`] on the in-process backends and plays the parts of
//! the outside world: the queue consumer, the notification listener and the
//! workflow orchestrator.

#![allow(dead_code)]

use async_trait::async_trait;
use bulkport_common::JobKey;
use bulkport_server::config::{ImportConfig, WorkflowConfig};
use bulkport_server::error::{ImportError, ImportResult};
use bulkport_server::ingest::dispatcher::StageRequest;
use bulkport_server::ingest::memory::{MemoryBus, MemoryJobStore, MemoryQueue, RecordingWorkflow};
use bulkport_server::ingest::notify::NotificationHandler;
use bulkport_server::ingest::strategy::{
    CommandReceipt, CommandSink, Comparison, ComparisonStatus, ImportStrategy, ProcessStrategy,
    WritePayload,
};
use bulkport_server::ingest::zip_bridge::ZipFinalizationHook;
use bulkport_server::ingest::{Backends, EntityProfile, ImportEngine, ImportJob, StrategyRegistry};
use bulkport_server::storage::memory::MemoryObjectStore;
use serde_json::{json, Value};
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};

pub const WIDGETS: &str = "widgets";
pub const TENANT: &str = "acme";
pub const BUCKET: &str = "imports";

// ============================================================================
// Widgets entity
// ============================================================================

/// Requires a `sku`; `qty` arrives from CSV as text and is stored as a number
pub struct WidgetImport;

#[async_trait]
impl ImportStrategy for WidgetImport {
    async fn transform(&self, mut input: Value) -> ImportResult<Value> {
        if let Some(map) = input.as_object_mut() {
            let qty = map.get("qty").and_then(Value::as_str).and_then(|q| q.parse::<i64>().ok());
            if let Some(qty) = qty {
                map.insert("qty".to_string(), json!(qty));
            }
        }
        Ok(input)
    }

    async fn validate(&self, attributes: &Value) -> ImportResult<()> {
        match attributes.get("sku").and_then(Value::as_str) {
            Some(sku) if !sku.is_empty() => Ok(()),
            _ => Err(ImportError::validation("sku is required")),
        }
    }
}

fn sku(attributes: &Value) -> &str {
    attributes.get("sku").and_then(Value::as_str).unwrap_or_default()
}

/// `same-*` skus already exist unchanged, everything else is new
pub struct WidgetProcess {
    sink: Arc<WidgetSink>,
}

#[async_trait]
impl ProcessStrategy for WidgetProcess {
    async fn compare(&self, attributes: &Value, _tenant: &str) -> ImportResult<Comparison> {
        if sku(attributes).starts_with("same-") {
            return Ok(Comparison::new(ComparisonStatus::Equal, Some(attributes.clone())));
        }
        Ok(Comparison::new(ComparisonStatus::NotExist, None))
    }

    async fn map(
        &self,
        _status: ComparisonStatus,
        attributes: &Value,
        _tenant: &str,
        _existing: Option<&Value>,
    ) -> ImportResult<WritePayload> {
        Ok(WritePayload::Create(attributes.clone()))
    }

    fn command_sink(&self) -> Arc<dyn CommandSink> {
        self.sink.clone()
    }
}

/// Rejects `bad-*` skus and defers `async-*` skus; records every write it accepts
#[derive(Default)]
pub struct WidgetSink {
    writes: Mutex<Vec<(JobKey, WritePayload)>>,
}

impl WidgetSink {
    pub fn writes(&self) -> Vec<(JobKey, WritePayload)> {
        self.writes.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandSink for WidgetSink {
    async fn submit(&self, source: &JobKey, payload: WritePayload) -> ImportResult<CommandReceipt> {
        let attributes = match &payload {
            WritePayload::Create(v) | WritePayload::Update(v) => v.clone(),
        };
        let sku = sku(&attributes).to_string();

        if sku.starts_with("bad-") {
            return Err(ImportError::validation(format!("Target rejected {sku}")));
        }
        self.writes.lock().unwrap().push((source.clone(), payload));

        if sku.starts_with("async-") {
            return Ok(CommandReceipt::Pending {
                command_id: format!("cmd-{sku}"),
            });
        }
        Ok(CommandReceipt::Settled(json!({ "id": sku })))
    }
}

// ============================================================================
// Engine harness
// ============================================================================

pub struct TestEngine {
    pub engine: ImportEngine,
    pub store: Arc<MemoryJobStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub bus: Arc<MemoryBus>,
    pub queue: Arc<MemoryQueue>,
    pub workflow: Arc<RecordingWorkflow>,
    pub sink: Arc<WidgetSink>,
    pub import_config: ImportConfig,
    pub workflow_config: WorkflowConfig,
    delivered: Mutex<usize>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_hooks(Vec::new())
    }

    pub fn with_hooks(hooks: Vec<Arc<dyn ZipFinalizationHook>>) -> Self {
        let store = Arc::new(MemoryJobStore::new());
        let objects = Arc::new(MemoryObjectStore::new(BUCKET));
        let bus = Arc::new(MemoryBus::new());
        let queue = Arc::new(MemoryQueue::new());
        let workflow = Arc::new(RecordingWorkflow::new());
        let sink = Arc::new(WidgetSink::default());

        let registry = StrategyRegistry::new().register(EntityProfile::new(
            WIDGETS,
            Arc::new(WidgetImport),
            Arc::new(WidgetProcess { sink: sink.clone() }),
        ));

        let import_config = ImportConfig::default();
        let workflow_config = WorkflowConfig::default();

        let engine = ImportEngine::new(
            &import_config,
            &workflow_config,
            registry,
            Backends {
                store: store.clone(),
                objects: objects.clone(),
                bus: bus.clone(),
                queue: queue.clone(),
                workflow: workflow.clone(),
            },
            hooks,
        );

        Self {
            engine,
            store,
            objects,
            bus,
            queue,
            workflow,
            sink,
            import_config,
            workflow_config,
            delivered: Mutex::new(0),
        }
    }

    pub fn status_channel(&self) -> &str {
        &self.import_config.status_channel
    }

    pub fn alarm_channel(&self) -> &str {
        &self.import_config.alarm_channel
    }

    pub async fn job(&self, key: &JobKey) -> ImportJob {
        self.engine.service.get_job(key).await.unwrap()
    }

    /// Run queued jobs and deliver status notifications until both are quiet.
    ///
    /// Handler errors are dropped here the way the queue records them.
    pub async fn pump(&self) {
        loop {
            let mut progressed = false;

            while let Some(message) = self.queue.pop() {
                let _ = self.engine.router.route(&message).await;
                progressed = true;
            }

            let published = self.bus.published(self.status_channel());
            let start = *self.delivered.lock().unwrap();
            for notification in &published[start..] {
                self.engine
                    .status_consumer()
                    .handle(notification)
                    .await
                    .unwrap();
                progressed = true;
            }
            *self.delivered.lock().unwrap() = published.len();

            if !progressed {
                break;
            }
        }
    }

    pub async fn stage(&self, stage: Option<&str>, input: Value, token: Option<&str>) -> ImportResult<Value> {
        self.engine
            .dispatcher
            .dispatch(StageRequest {
                stage: stage.map(str::to_string),
                input,
                task_token: token.map(str::to_string),
            })
            .await
    }

    /// Play the CSV pipeline for one execution input: page the file through the
    /// loader and mapper, then finalize with the number of rows mapped.
    pub async fn run_csv_pipeline(&self, execution_input: &Value) -> Value {
        let mut offset = 0_u64;
        let mut rows = 0_i64;

        loop {
            let mut input = execution_input.clone();
            input["offset"] = json!(offset);
            let batch = self.stage(Some("loader"), input, None).await.unwrap();

            let items = batch["items"].as_array().cloned().unwrap_or_default();
            rows += items.len() as i64;
            if !items.is_empty() {
                self.stage(
                    None,
                    json!({ "batchInput": batch["batchInput"], "items": items }),
                    None,
                )
                .await
                .unwrap();
            }

            match batch["nextOffset"].as_u64() {
                Some(next) => offset = next,
                None => break,
            }
        }

        self.stage(
            Some("finalize"),
            json!({ "sourceId": execution_input["sourceId"], "resultCount": rows }),
            None,
        )
        .await
        .unwrap()
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// ZIP archive holding `files` as `(name, contents)`
pub fn zip_archive(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, body) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}
