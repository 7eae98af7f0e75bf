//! In-process backends
//!
//! Used by the test suite and for running the engine without PostgreSQL. The job
//! store holds one lock per operation, which gives the same atomicity the SQL
//! store gets from single-statement updates.

use async_trait::async_trait;
use bulkport_common::{ImportStatus, JobKey, Notification};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use super::model::{ImportJob, JobPatch, Outcome, RowTotals};
use super::notify::NotificationBus;
use super::queue::{ImportQueueMessage, JobQueue};
use super::store::JobStore;
use super::workflow::WorkflowClient;
use crate::error::{ImportError, ImportResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct MemoryJobState {
    jobs: BTreeMap<JobKey, ImportJob>,
    /// Unprocessed counts to report on successive batch calls
    scripted_unprocessed: VecDeque<usize>,
    batch_calls: Vec<tokio::time::Instant>,
}

#[derive(Clone, Default)]
pub struct MemoryJobStore {
    state: Arc<Mutex<MemoryJobState>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next batch calls leave this many items unprocessed, one entry per call
    #[cfg(any(test, feature = "test-util"))]
    pub fn script_unprocessed(&self, counts: impl IntoIterator<Item = usize>) {
        lock(&self.state).scripted_unprocessed.extend(counts);
    }

    /// When each raw batch call happened
    #[cfg(any(test, feature = "test-util"))]
    pub fn batch_calls(&self) -> Vec<tokio::time::Instant> {
        lock(&self.state).batch_calls.clone()
    }

    pub fn jobs(&self) -> Vec<ImportJob> {
        lock(&self.state).jobs.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn with_job<T>(
        &self,
        key: &JobKey,
        f: impl FnOnce(&mut ImportJob) -> T,
    ) -> ImportResult<T> {
        let mut state = lock(&self.state);
        let job = state
            .jobs
            .get_mut(key)
            .ok_or_else(|| ImportError::JobNotFound(key.id()))?;
        let out = f(job);
        Ok(out)
    }

    /// Split `items` into written and unprocessed according to the script
    fn take_unprocessed<T: Clone>(&self, items: &[T]) -> (Vec<T>, Vec<T>) {
        let mut state = lock(&self.state);
        state.batch_calls.push(tokio::time::Instant::now());
        let left = state
            .scripted_unprocessed
            .pop_front()
            .unwrap_or(0)
            .min(items.len());
        let split = items.len() - left;
        (items[..split].to_vec(), items[split..].to_vec())
    }
}

fn touch(job: &mut ImportJob) {
    job.version += 1;
    job.updated_at = chrono::Utc::now();
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn ping(&self) -> ImportResult<()> {
        Ok(())
    }

    async fn put(&self, job: &ImportJob) -> ImportResult<()> {
        lock(&self.state).jobs.insert(job.key(), job.clone());
        Ok(())
    }

    async fn get(&self, key: &JobKey) -> ImportResult<Option<ImportJob>> {
        Ok(lock(&self.state).jobs.get(key).cloned())
    }

    async fn update(&self, key: &JobKey, patch: &JobPatch) -> ImportResult<Option<ImportJob>> {
        self.with_job(key, |job| {
            if let Some(status) = patch.status {
                if !job.status.can_transition_to(status) {
                    return None;
                }
                job.status = status;
            }
            if let Some(attributes) = &patch.attributes {
                match job.attributes.as_object_mut() {
                    Some(current) => current.extend(attributes.clone()),
                    None => job.attributes = Value::Object(attributes.clone()),
                }
            }
            if let Some(result) = &patch.result {
                job.result = Some(result.clone());
            }
            if let Some(user) = &patch.updated_by {
                job.updated_by = user.clone();
            }
            touch(job);
            Some(job.clone())
        })
    }

    async fn increment_counters(&self, key: &JobKey, outcome: Outcome) -> ImportResult<ImportJob> {
        self.with_job(key, |job| {
            job.processed_rows += 1;
            match outcome {
                Outcome::Succeeded => job.succeeded_rows += 1,
                Outcome::Failed => job.failed_rows += 1,
            }
            touch(job);
            job.clone()
        })
    }

    async fn set_total_rows(&self, key: &JobKey, total_rows: i64) -> ImportResult<ImportJob> {
        self.with_job(key, |job| {
            if !job.status.is_terminal() {
                job.total_rows = total_rows;
                touch(job);
            }
            job.clone()
        })
    }

    async fn record_totals(&self, key: &JobKey, totals: RowTotals) -> ImportResult<ImportJob> {
        self.with_job(key, |job| {
            if job.status.is_terminal() {
                return job.clone();
            }
            job.total_rows = totals.total;
            job.processed_rows = totals.processed;
            job.succeeded_rows = totals.succeeded;
            job.failed_rows = totals.failed;
            touch(job);
            job.clone()
        })
    }

    async fn list_children(&self, parent: &JobKey) -> ImportResult<Vec<ImportJob>> {
        let parent_id = parent.id();
        Ok(lock(&self.state)
            .jobs
            .values()
            .filter(|job| job.parent_key.as_deref() == Some(parent_id.as_str()))
            .cloned()
            .collect())
    }

    async fn batch_write_raw(&self, jobs: &[ImportJob]) -> ImportResult<Vec<ImportJob>> {
        let (written, unprocessed) = self.take_unprocessed(jobs);
        let mut state = lock(&self.state);
        for job in written {
            state.jobs.insert(job.key(), job);
        }
        Ok(unprocessed)
    }

    async fn batch_delete_raw(&self, keys: &[JobKey]) -> ImportResult<Vec<JobKey>> {
        let (deleted, unprocessed) = self.take_unprocessed(keys);
        let mut state = lock(&self.state);
        for key in deleted {
            state.jobs.remove(&key);
        }
        Ok(unprocessed)
    }
}

/// Bus that records every published notification
#[derive(Clone, Default)]
pub struct MemoryBus {
    published: Arc<Mutex<Vec<(String, Notification)>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self, channel: &str) -> Vec<Notification> {
        lock(&self.published)
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, n)| n.clone())
            .collect()
    }

    /// Remove and return what was published on `channel`
    pub fn drain(&self, channel: &str) -> Vec<Notification> {
        let mut published = lock(&self.published);
        let (taken, kept): (Vec<_>, Vec<_>) = published.drain(..).partition(|(c, _)| c == channel);
        *published = kept;
        taken.into_iter().map(|(_, n)| n).collect()
    }

    /// Status notifications published for `key`
    pub fn statuses_for(&self, channel: &str, key: &JobKey) -> Vec<ImportStatus> {
        self.published(channel)
            .iter()
            .filter(|n| n.job_key() == *key)
            .filter_map(Notification::import_status)
            .collect()
    }
}

#[async_trait]
impl NotificationBus for MemoryBus {
    async fn publish(&self, channel: &str, notification: &Notification) -> ImportResult<()> {
        lock(&self.published).push((channel.to_string(), notification.clone()));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MemoryQueue {
    messages: Arc<Mutex<VecDeque<ImportQueueMessage>>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<ImportQueueMessage> {
        lock(&self.messages).pop_front()
    }

    pub fn drain(&self) -> Vec<ImportQueueMessage> {
        lock(&self.messages).drain(..).collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.messages).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn enqueue(&self, message: ImportQueueMessage) -> ImportResult<()> {
        lock(&self.messages).push_back(message);
        Ok(())
    }
}

/// A call the engine made to the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowCall {
    Start { pipeline: String, name: String, input: Value },
    Success { token: String, output: Value },
    Failure { token: String, error_code: String, cause: String },
}

/// Orchestrator stand-in that records calls
#[derive(Clone, Default)]
pub struct RecordingWorkflow {
    calls: Arc<Mutex<Vec<WorkflowCall>>>,
    fail_starts: Arc<Mutex<bool>>,
}

impl RecordingWorkflow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<WorkflowCall> {
        lock(&self.calls).clone()
    }

    /// Make `start_execution` fail from now on
    pub fn fail_starts(&self) {
        *lock(&self.fail_starts) = true;
    }

    pub fn started_inputs(&self, pipeline: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                WorkflowCall::Start { pipeline: p, input, .. } if p == pipeline => Some(input),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl WorkflowClient for RecordingWorkflow {
    async fn start_execution(&self, pipeline: &str, name: &str, input: &Value) -> ImportResult<String> {
        if *lock(&self.fail_starts) {
            return Err(ImportError::Workflow("orchestrator unavailable".to_string()));
        }
        let mut calls = lock(&self.calls);
        calls.push(WorkflowCall::Start {
            pipeline: pipeline.to_string(),
            name: name.to_string(),
            input: input.clone(),
        });
        Ok(format!("exec-{}", calls.len()))
    }

    async fn send_task_success(&self, token: &str, output: &Value) -> ImportResult<()> {
        lock(&self.calls).push(WorkflowCall::Success {
            token: token.to_string(),
            output: output.clone(),
        });
        Ok(())
    }

    async fn send_task_failure(&self, token: &str, error_code: &str, cause: &str) -> ImportResult<()> {
        lock(&self.calls).push(WorkflowCall::Failure {
            token: token.to_string(),
            error_code: error_code.to_string(),
            cause: cause.to_string(),
        });
        Ok(())
    }
}
