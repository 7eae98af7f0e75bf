//! External workflow orchestrator client
//!
//! The orchestrator runs the CSV and ZIP pipelines and calls back into the engine
//! once per stage. The engine talks to it for three things: starting a pipeline
//! execution, and resolving a paused task by its callback token with either success
//! or failure.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::config::WorkflowConfig;
use crate::error::{ImportError, ImportResult};

#[async_trait]
pub trait WorkflowClient: Send + Sync {
    /// Start `pipeline` with `input`; returns the execution id
    async fn start_execution(&self, pipeline: &str, name: &str, input: &Value) -> ImportResult<String>;

    async fn send_task_success(&self, token: &str, output: &Value) -> ImportResult<()>;

    async fn send_task_failure(&self, token: &str, error_code: &str, cause: &str) -> ImportResult<()>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartExecutionRequest<'a> {
    pipeline: &'a str,
    name: &'a str,
    input: &'a Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartExecutionResponse {
    execution_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskSuccessRequest<'a> {
    token: &'a str,
    output: &'a Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TaskFailureRequest<'a> {
    token: &'a str,
    error_code: &'a str,
    cause_json: &'a str,
}

/// JSON-over-HTTP orchestrator client
#[derive(Clone)]
pub struct HttpWorkflowClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpWorkflowClient {
    pub fn new(config: &WorkflowConfig) -> ImportResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ImportError::Workflow(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> ImportResult<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ImportError::Workflow(format!("POST {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ImportError::Workflow(format!(
                "POST {url} returned {status}: {body}"
            )));
        }

        Ok(response)
    }
}

#[async_trait]
impl WorkflowClient for HttpWorkflowClient {
    #[instrument(skip(self, input))]
    async fn start_execution(&self, pipeline: &str, name: &str, input: &Value) -> ImportResult<String> {
        let response = self
            .post(
                "/executions",
                &StartExecutionRequest {
                    pipeline,
                    name,
                    input,
                },
            )
            .await?;

        let started: StartExecutionResponse = response
            .json()
            .await
            .map_err(|e| ImportError::Workflow(format!("Invalid start execution response: {e}")))?;

        info!(execution_id = %started.execution_id, "Started workflow execution");
        Ok(started.execution_id)
    }

    #[instrument(skip(self, token, output))]
    async fn send_task_success(&self, token: &str, output: &Value) -> ImportResult<()> {
        self.post("/tasks/success", &TaskSuccessRequest { token, output })
            .await?;
        debug!("Resumed paused task with success");
        Ok(())
    }

    #[instrument(skip(self, token, cause))]
    async fn send_task_failure(&self, token: &str, error_code: &str, cause: &str) -> ImportResult<()> {
        self.post(
            "/tasks/failure",
            &TaskFailureRequest {
                token,
                error_code,
                cause_json: cause,
            },
        )
        .await?;
        debug!("Resumed paused task with failure");
        Ok(())
    }
}
