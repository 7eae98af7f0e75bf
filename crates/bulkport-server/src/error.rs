//! Import engine error types

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::{json, Value};
use thiserror::Error;

/// Result type alias for engine operations
pub type ImportResult<T> = std::result::Result<T, ImportError>;

#[derive(Error, Debug)]
pub enum ImportError {
    /// A row or request failed transform/validate
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("No strategy registered for entity type: {0}")]
    StrategyNotFound(String),

    #[error("Import job not found: {0}")]
    JobNotFound(String),

    /// A conditional write lost a race with a concurrent writer
    #[error("Conditional update failed for {key}: {message}")]
    StoreCondition { key: String, message: String },

    #[error("Unknown pipeline stage: {0}")]
    Orchestration(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv_async::Error),

    #[error("Archive error: {0}")]
    Archive(#[from] zip::result::ZipError),

    #[error("No CSV files found in the ZIP archive.")]
    EmptyArchive,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Object store error: {0}")]
    ObjectStore(String),

    #[error("Notification bus error: {0}")]
    Bus(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Workflow error: {0}")]
    Workflow(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Common(#[from] bulkport_common::CommonError),
}

impl ImportError {
    pub fn validation(message: impl Into<String>) -> Self {
        ImportError::Validation(message.into())
    }

    /// Whether retrying the same operation could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ImportError::StoreCondition { .. }
                | ImportError::Database(_)
                | ImportError::ObjectStore(_)
                | ImportError::Bus(_)
                | ImportError::Queue(_)
                | ImportError::Workflow(_)
                | ImportError::Io(_)
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ImportError::Validation(_) => "ValidationError",
            ImportError::StrategyNotFound(_) | ImportError::JobNotFound(_) => "NotFoundError",
            ImportError::StoreCondition { .. } => "StoreConditionError",
            ImportError::Orchestration(_) => "OrchestrationError",
            ImportError::BadRequest(_) => "BadRequestError",
            ImportError::Csv(_) => "CsvError",
            ImportError::Archive(_) | ImportError::EmptyArchive => "ArchiveError",
            ImportError::Database(_) => "DatabaseError",
            ImportError::ObjectStore(_) => "ObjectStoreError",
            ImportError::Bus(_) => "BusError",
            ImportError::Queue(_) => "QueueError",
            ImportError::Workflow(_) => "WorkflowError",
            ImportError::Serialization(_) => "SerializationError",
            ImportError::Io(_) => "IoError",
            ImportError::Common(_) => "InvalidInputError",
        }
    }

    /// Captured form stored on a failed job and sent with alarms
    pub fn to_json(&self) -> Value {
        json!({
            "kind": self.kind(),
            "message": self.to_string(),
            "retryable": self.is_retryable(),
        })
    }
}

impl IntoResponse for ImportError {
    fn into_response(self) -> Response {
        let status = match &self {
            ImportError::Validation(_)
            | ImportError::BadRequest(_)
            | ImportError::Common(_)
            | ImportError::Csv(_)
            | ImportError::Archive(_)
            | ImportError::EmptyArchive => StatusCode::BAD_REQUEST,
            ImportError::StrategyNotFound(_) | ImportError::JobNotFound(_) => StatusCode::NOT_FOUND,
            ImportError::StoreCondition { .. } => StatusCode::CONFLICT,
            _ => {
                tracing::error!(error = %self, "Stage handler failed");
                StatusCode::INTERNAL_SERVER_ERROR
            },
        };

        let body = Json(json!({
            "error": {
                "kind": self.kind(),
                "message": self.to_string(),
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(ImportError::StoreCondition {
            key: "k".into(),
            message: "lost race".into()
        }
        .is_retryable());
        assert!(ImportError::Workflow("503".into()).is_retryable());
        assert!(!ImportError::validation("bad row").is_retryable());
        assert!(!ImportError::StrategyNotFound("ghost".into()).is_retryable());
        assert!(!ImportError::JobNotFound("x".into()).is_retryable());
    }

    #[test]
    fn test_to_json() {
        let value = ImportError::StrategyNotFound("ghost".into()).to_json();
        assert_eq!(value["kind"], "NotFoundError");
        assert_eq!(value["message"], "No strategy registered for entity type: ghost");
        assert_eq!(value["retryable"], false);
    }

    #[test]
    fn test_status_codes() {
        let response = ImportError::validation("row 2: name is required").into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = ImportError::JobNotFound("x".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
