//! ZIP orchestration bridge
//!
//! The ZIP pipeline walks the extracted CSV files one at a time. For each file it
//! calls `trigger-single-and-wait` with a callback token and then pauses; the bridge
//! creates a CSV master job holding that token and returns straight away. When the
//! CSV job finishes, [`StatusConsumer`](super::notify::StatusConsumer) resumes the
//! paused task and the pipeline moves on to the next file. `finalize-zip` sums the
//! per-file results onto the ZIP master job.

use async_trait::async_trait;
use bulkport_common::{ImportStatus, JobKey};
use futures::future::join_all;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::{Arc, LazyLock};
use tracing::{debug, error, info, instrument, warn};

use super::counters::CounterAggregator;
use super::model::{file_name, CreateCsvImportRequest, ProcessingMode, RowTotals};
use super::service::ImportService;
use crate::error::{ImportError, ImportResult};

/// Parameters the ZIP pipeline passes through to every file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZipParameters {
    pub bucket: String,
    pub tenant_code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerInput {
    pub master_job_key: JobKey,
    /// Object key of one extracted CSV file
    pub key: String,
    pub parameters: ZipParameters,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizeZipInput {
    pub master_job_key: JobKey,
    /// Outputs of the per-file waits, in file order
    #[serde(default)]
    pub results: Vec<Value>,
    #[serde(default)]
    pub execution_input: Value,
}

/// Totals reported for one file. Either naming is accepted.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct FileTotals {
    #[serde(default, alias = "totalRows")]
    total: i64,
    #[serde(default, alias = "succeededRows")]
    succeeded: i64,
    #[serde(default, alias = "failedRows")]
    failed: i64,
}

/// Sum per-file results. A result may be wrapped as `{result: {...}}`.
pub fn aggregate_results(results: &[Value]) -> RowTotals {
    results.iter().fold(RowTotals::default(), |mut acc, raw| {
        let inner = raw.get("result").filter(|r| r.is_object()).unwrap_or(raw);
        let file = match FileTotals::deserialize(inner) {
            Ok(file) => file,
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable file result");
                FileTotals::default()
            },
        };
        acc.total += file.total;
        acc.succeeded += file.succeeded;
        acc.failed += file.failed;
        acc.processed = acc.succeeded + acc.failed;
        acc
    })
}

static TABLE_FILE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{14}-(.+)\.csv$").expect("table file pattern should compile")
});

/// Table name from a `yyyymmddhhMMss-{table}.csv` file name
pub fn table_name_from_key(key: &str) -> ImportResult<String> {
    TABLE_FILE_PATTERN
        .captures(file_name(key))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| {
            ImportError::BadRequest(format!(
                "Could not parse tableName from filename: {key}. Expected format: yyyymmddhhMMss-{{tableName}}.csv"
            ))
        })
}

/// What a finalization hook is told about the finished ZIP job
#[derive(Debug, Clone)]
pub struct ZipFinalizationContext {
    pub master_job_key: JobKey,
    pub totals: RowTotals,
    pub status: ImportStatus,
    pub execution_input: Value,
}

/// Runs once a ZIP job's results are aggregated. Failures are logged and never
/// change the job outcome.
#[async_trait]
pub trait ZipFinalizationHook: Send + Sync {
    async fn execute(&self, context: &ZipFinalizationContext) -> ImportResult<()>;
}

#[derive(Clone)]
pub struct ZipBridge {
    service: ImportService,
    counters: CounterAggregator,
    hooks: Vec<Arc<dyn ZipFinalizationHook>>,
}

impl ZipBridge {
    pub fn new(
        service: ImportService,
        counters: CounterAggregator,
        hooks: Vec<Arc<dyn ZipFinalizationHook>>,
    ) -> Self {
        Self {
            service,
            counters,
            hooks,
        }
    }

    /// Create and submit the CSV job for one file, storing the token the pipeline
    /// is paused on
    #[instrument(skip(self, input, token), fields(master = %input.master_job_key, key = %input.key))]
    pub async fn trigger_single_and_wait(
        &self,
        input: TriggerInput,
        token: Option<&str>,
    ) -> ImportResult<Value> {
        let token = token.ok_or_else(|| {
            ImportError::BadRequest("trigger-single-and-wait requires a task token".to_string())
        })?;

        let table_name = match input.parameters.table_name {
            Some(table) => table,
            None => table_name_from_key(&input.key)?,
        };

        let request = CreateCsvImportRequest {
            tenant_code: input.parameters.tenant_code,
            table_name,
            bucket: input.parameters.bucket,
            key: input.key,
            processing_mode: ProcessingMode::Workflow,
        };

        let job = self
            .service
            .create_csv_job_with_token(request, token, &input.master_job_key)
            .await?;
        let job = self.service.submit(&job).await?;

        info!(job_key = %job.id, table = %job.entity_type, "Created CSV job with task token");
        Ok(json!({ "jobKey": job.id }))
    }

    /// Aggregate per-file totals onto the ZIP master job and finalize it
    #[instrument(skip(self, input), fields(master = %input.master_job_key, files = input.results.len()))]
    pub async fn finalize_zip(&self, input: FinalizeZipInput) -> ImportResult<Value> {
        let totals = aggregate_results(&input.results);
        let status = ImportStatus::for_outcome(totals.failed);
        debug!(?totals, %status, "Aggregated ZIP results");

        self.run_hooks(&ZipFinalizationContext {
            master_job_key: input.master_job_key.clone(),
            totals,
            status,
            execution_input: input.execution_input,
        })
        .await;

        let job = self.counters.settle(&input.master_job_key, totals).await?;

        info!(status = %job.status, "Finalized ZIP job");
        Ok(json!({
            "jobKey": job.id,
            "status": job.status,
            "total": job.total_rows,
            "succeeded": job.succeeded_rows,
            "failed": job.failed_rows,
        }))
    }

    async fn run_hooks(&self, context: &ZipFinalizationContext) {
        if self.hooks.is_empty() {
            debug!("No ZIP finalization hooks registered");
            return;
        }

        let count = self.hooks.len();
        let runs = self.hooks.iter().enumerate().map(|(index, hook)| async move {
            match hook.execute(context).await {
                Ok(()) => debug!(hook = index + 1, count, "ZIP finalization hook completed"),
                Err(e) => error!(hook = index + 1, count, error = %e, "ZIP finalization hook failed"),
            }
        });
        join_all(runs).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_name_from_key() {
        assert_eq!(
            table_name_from_key("unzipped/acme/job/20240101120000-widgets.csv").unwrap(),
            "widgets"
        );
        assert_eq!(
            table_name_from_key("20240101120000-order-lines.csv").unwrap(),
            "order-lines"
        );
        assert!(matches!(
            table_name_from_key("unzipped/acme/job/widgets.csv"),
            Err(ImportError::BadRequest(_))
        ));
    }

    #[test]
    fn test_aggregate_accepts_both_namings() {
        let totals = aggregate_results(&[
            json!({"result": {"total": 3, "succeeded": 2, "failed": 1}}),
            json!({"totalRows": 4, "succeededRows": 4, "failedRows": 0}),
            json!("garbage"),
        ]);

        assert_eq!(
            totals,
            RowTotals {
                total: 7,
                processed: 7,
                succeeded: 6,
                failed: 1,
            }
        );
    }

    #[test]
    fn test_aggregate_empty() {
        assert_eq!(aggregate_results(&[]), RowTotals::default());
    }
}
