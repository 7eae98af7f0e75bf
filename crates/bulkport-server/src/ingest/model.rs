//! Import job records and request types

use bulkport_common::{ImportStatus, JobKey, JobKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Author recorded on jobs the engine creates on its own behalf
pub const SYSTEM_USER: &str = "system";

/// Persisted import job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct ImportJob {
    pub partition_key: String,
    pub sort_key: String,
    /// `partition#sort`
    pub id: String,
    pub version: i64,
    pub code: String,
    pub name: String,
    /// Table / entity type the strategy registry is keyed by
    pub entity_type: String,
    #[sqlx(try_from = "String")]
    pub status: ImportStatus,
    pub attributes: Value,
    pub result: Option<Value>,
    pub total_rows: i64,
    pub processed_rows: i64,
    pub succeeded_rows: i64,
    pub failed_rows: i64,
    pub parent_key: Option<String>,
    pub callback_token: Option<String>,
    pub request_id: Option<String>,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub created_ip: Option<String>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
    pub updated_ip: Option<String>,
}

/// Fields supplied when creating a job; everything else starts at its initial value
#[derive(Debug, Clone)]
pub struct NewImportJob {
    pub key: JobKey,
    pub code: String,
    pub name: String,
    pub entity_type: String,
    pub attributes: Value,
    pub parent_key: Option<JobKey>,
    pub callback_token: Option<String>,
    pub context: RequestContext,
}

impl ImportJob {
    pub fn new(params: NewImportJob) -> Self {
        let now = Utc::now();
        let user = params.context.user_or_system().to_string();

        Self {
            id: params.key.id(),
            partition_key: params.key.partition_key,
            sort_key: params.key.sort_key,
            version: 1,
            code: params.code,
            name: params.name,
            entity_type: params.entity_type,
            status: ImportStatus::Created,
            attributes: params.attributes,
            result: None,
            total_rows: 0,
            processed_rows: 0,
            succeeded_rows: 0,
            failed_rows: 0,
            parent_key: params.parent_key.map(|k| k.id()),
            callback_token: params.callback_token,
            request_id: params.context.request_id,
            created_by: user.clone(),
            created_at: now,
            created_ip: params.context.ip.clone(),
            updated_by: user,
            updated_at: now,
            updated_ip: params.context.ip,
        }
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(self.partition_key.clone(), self.sort_key.clone())
    }

    pub fn kind(&self) -> Option<JobKind> {
        self.key().kind()
    }

    pub fn tenant(&self) -> String {
        self.key().tenant().to_string()
    }

    /// Explicit parent if one was recorded, else the one encoded in the sort key
    pub fn parent(&self) -> Option<JobKey> {
        self.parent_key
            .as_deref()
            .and_then(|id| JobKey::parse(id).ok())
            .or_else(|| self.key().parent())
    }

    pub fn totals(&self) -> RowTotals {
        RowTotals {
            total: self.total_rows,
            processed: self.processed_rows,
            succeeded: self.succeeded_rows,
            failed: self.failed_rows,
        }
    }

    /// String attribute lookup
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes.get(name).and_then(Value::as_str)
    }
}

/// Fresh time-ordered id for a new job. UUIDv7 strings sort by creation time.
pub fn new_job_id() -> String {
    Uuid::now_v7().to_string()
}

/// Counters of a master job
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowTotals {
    pub total: i64,
    pub processed: i64,
    pub succeeded: i64,
    pub failed: i64,
}

/// Result of one child job as reported to its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Succeeded,
    Failed,
}

impl Outcome {
    pub fn from_success(succeeded: bool) -> Self {
        if succeeded {
            Outcome::Succeeded
        } else {
            Outcome::Failed
        }
    }
}

/// Partial update. `None` fields are left untouched.
///
/// `attributes` is merged key by key into the stored object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobPatch {
    pub status: Option<ImportStatus>,
    pub attributes: Option<Map<String, Value>>,
    pub result: Option<Value>,
    pub updated_by: Option<String>,
}

impl JobPatch {
    pub fn status(status: ImportStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: Value) -> Self {
        self.attributes
            .get_or_insert_with(Map::new)
            .insert(name.into(), value);
        self
    }
}

/// Caller identity carried onto created jobs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    pub user_id: Option<String>,
    pub ip: Option<String>,
    pub request_id: Option<String>,
}

impl RequestContext {
    pub fn system() -> Self {
        Self {
            user_id: Some(SYSTEM_USER.to_string()),
            ..Default::default()
        }
    }

    pub fn user_or_system(&self) -> &str {
        self.user_id.as_deref().unwrap_or(SYSTEM_USER)
    }
}

/// Single-record import submitted directly
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateImportRequest {
    pub tenant_code: String,
    pub table_name: String,
    #[serde(default)]
    pub name: Option<String>,
    pub attributes: Value,
    /// Master job this record belongs to
    #[serde(default)]
    pub source_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessingMode {
    /// Parse in-process, one record job per valid row
    Direct,
    /// Hand the file to the external orchestrator
    #[default]
    Workflow,
}

/// CSV file import
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateCsvImportRequest {
    pub tenant_code: String,
    pub table_name: String,
    pub bucket: String,
    pub key: String,
    #[serde(default)]
    pub processing_mode: ProcessingMode,
}

/// ZIP archive import
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateZipImportRequest {
    pub tenant_code: String,
    pub bucket: String,
    pub key: String,
    /// Table for every member; derived per file name when absent
    #[serde(default)]
    pub table_name: Option<String>,
}

/// Last path segment of an object key
pub fn file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_job(key: JobKey) -> ImportJob {
        ImportJob::new(NewImportJob {
            key,
            code: "c".into(),
            name: "n".into(),
            entity_type: "widgets".into(),
            attributes: json!({"bucket": "b"}),
            parent_key: None,
            callback_token: None,
            context: RequestContext::default(),
        })
    }

    #[test]
    fn test_new_job_defaults() {
        let job = new_job(JobKey::new("CSV_IMPORT#acme", "widgets#01J"));
        assert_eq!(job.status, ImportStatus::Created);
        assert_eq!(job.id, "CSV_IMPORT#acme#widgets#01J");
        assert_eq!(job.totals(), RowTotals::default());
        assert_eq!(job.created_by, SYSTEM_USER);
        assert_eq!(job.attribute("bucket"), Some("b"));
        assert_eq!(job.kind(), Some(JobKind::CsvMaster));
    }

    #[test]
    fn test_parent_prefers_explicit_key() {
        let mut job = new_job(JobKey::new("CSV_IMPORT#acme", "widgets#01K"));
        assert_eq!(job.parent(), None);

        job.parent_key = Some("ZIP_IMPORT#acme#ZIP#01J".into());
        assert_eq!(job.parent(), Some(JobKey::new("ZIP_IMPORT#acme", "ZIP#01J")));
    }

    #[test]
    fn test_snapshot_uses_camel_case() {
        let job = new_job(JobKey::new("IMPORT#acme", "widgets#01K"));
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["status"], "CREATED");
        assert_eq!(value["partitionKey"], "IMPORT#acme");
        assert!(value.get("processedRows").is_some());
    }

    #[test]
    fn test_patch_builder() {
        let patch = JobPatch::status(ImportStatus::Processing)
            .with_attribute("step", json!("Unzipping archive"))
            .with_result(json!({"ok": true}));
        assert_eq!(patch.status, Some(ImportStatus::Processing));
        assert_eq!(patch.attributes.unwrap()["step"], "Unzipping archive");
    }

    #[test]
    fn test_file_name() {
        assert_eq!(file_name("uploads/acme/20240101120000-widgets.csv"), "20240101120000-widgets.csv");
        assert_eq!(file_name("plain.csv"), "plain.csv");
    }
}
