//! PostgreSQL job store
//!
//! Counters are updated with a single `UPDATE ... RETURNING *`, so concurrent
//! children never read-modify-write the parent row. Terminal statuses are protected
//! in the `WHERE` clause of every status write.

use async_trait::async_trait;
use bulkport_common::JobKey;
use sqlx::PgPool;
use std::sync::Arc;
use tracing::{debug, instrument, warn};

use super::model::{ImportJob, JobPatch, Outcome, RowTotals};
use super::store::JobStore;
use crate::error::{ImportError, ImportResult};

/// Postgres SQLSTATEs for transactions that lost a race and can be replayed
const RETRYABLE_SQLSTATES: [&str; 2] = ["40001", "40P01"];

#[derive(Clone)]
pub struct PgJobStore {
    pool: Arc<PgPool>,
}

impl PgJobStore {
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

/// Map serialization failures and deadlocks to `StoreCondition` so callers retry them
fn classify(key: &JobKey, err: sqlx::Error) -> ImportError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err
            .code()
            .is_some_and(|code| RETRYABLE_SQLSTATES.contains(&code.as_ref()))
        {
            return ImportError::StoreCondition {
                key: key.id(),
                message: db_err.message().to_string(),
            };
        }
    }
    ImportError::Database(err)
}

const INSERT_JOB: &str = r#"
    INSERT INTO import_jobs (
        partition_key, sort_key, id, version, code, name, entity_type, status,
        attributes, result, total_rows, processed_rows, succeeded_rows, failed_rows,
        parent_key, callback_token, request_id,
        created_by, created_at, created_ip, updated_by, updated_at, updated_ip
    )
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
            $15, $16, $17, $18, $19, $20, $21, $22, $23)
    ON CONFLICT (partition_key, sort_key) DO UPDATE SET
        version = EXCLUDED.version,
        code = EXCLUDED.code,
        name = EXCLUDED.name,
        entity_type = EXCLUDED.entity_type,
        status = EXCLUDED.status,
        attributes = EXCLUDED.attributes,
        result = EXCLUDED.result,
        total_rows = EXCLUDED.total_rows,
        processed_rows = EXCLUDED.processed_rows,
        succeeded_rows = EXCLUDED.succeeded_rows,
        failed_rows = EXCLUDED.failed_rows,
        parent_key = EXCLUDED.parent_key,
        callback_token = EXCLUDED.callback_token,
        request_id = EXCLUDED.request_id,
        updated_by = EXCLUDED.updated_by,
        updated_at = EXCLUDED.updated_at,
        updated_ip = EXCLUDED.updated_ip
"#;

impl PgJobStore {
    async fn insert<'e, E>(&self, executor: E, job: &ImportJob) -> Result<(), sqlx::Error>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query(INSERT_JOB)
            .bind(&job.partition_key)
            .bind(&job.sort_key)
            .bind(&job.id)
            .bind(job.version)
            .bind(&job.code)
            .bind(&job.name)
            .bind(&job.entity_type)
            .bind(job.status.as_str())
            .bind(&job.attributes)
            .bind(&job.result)
            .bind(job.total_rows)
            .bind(job.processed_rows)
            .bind(job.succeeded_rows)
            .bind(job.failed_rows)
            .bind(&job.parent_key)
            .bind(&job.callback_token)
            .bind(&job.request_id)
            .bind(&job.created_by)
            .bind(job.created_at)
            .bind(&job.created_ip)
            .bind(&job.updated_by)
            .bind(job.updated_at)
            .bind(&job.updated_ip)
            .execute(executor)
            .await?;
        Ok(())
    }

    async fn exists(&self, key: &JobKey) -> ImportResult<bool> {
        let found: Option<(i64,)> = sqlx::query_as(
            "SELECT 1::BIGINT FROM import_jobs WHERE partition_key = $1 AND sort_key = $2",
        )
        .bind(&key.partition_key)
        .bind(&key.sort_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| classify(key, e))?;
        Ok(found.is_some())
    }

    /// Counter writes skip terminal jobs; hand back the stored row unchanged in that case
    async fn applied_or_current(
        &self,
        key: &JobKey,
        updated: Option<ImportJob>,
    ) -> ImportResult<ImportJob> {
        match updated {
            Some(job) => Ok(job),
            None => {
                debug!(job = %key.id(), "job is terminal, counters left unchanged");
                self.get(key)
                    .await?
                    .ok_or_else(|| ImportError::JobNotFound(key.id()))
            }
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn ping(&self) -> ImportResult<()> {
        sqlx::query("SELECT 1").execute(&*self.pool).await?;
        Ok(())
    }

    #[instrument(skip(self, job), fields(job_key = %job.id))]
    async fn put(&self, job: &ImportJob) -> ImportResult<()> {
        self.insert(&*self.pool, job)
            .await
            .map_err(|e| classify(&job.key(), e))
    }

    async fn get(&self, key: &JobKey) -> ImportResult<Option<ImportJob>> {
        sqlx::query_as::<_, ImportJob>(
            "SELECT * FROM import_jobs WHERE partition_key = $1 AND sort_key = $2",
        )
        .bind(&key.partition_key)
        .bind(&key.sort_key)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| classify(key, e))
    }

    #[instrument(skip(self, patch), fields(job_key = %key, status = ?patch.status))]
    async fn update(&self, key: &JobKey, patch: &JobPatch) -> ImportResult<Option<ImportJob>> {
        let attributes = patch
            .attributes
            .as_ref()
            .map(|map| serde_json::Value::Object(map.clone()));

        let updated = sqlx::query_as::<_, ImportJob>(
            r#"
            UPDATE import_jobs SET
                status = COALESCE($3, status),
                attributes = CASE WHEN $4::JSONB IS NULL THEN attributes ELSE attributes || $4::JSONB END,
                result = COALESCE($5, result),
                updated_by = COALESCE($6, updated_by),
                updated_at = NOW(),
                version = version + 1
            WHERE partition_key = $1 AND sort_key = $2
              AND ($3::TEXT IS NULL OR status NOT IN ('COMPLETED', 'FAILED'))
            RETURNING *
            "#,
        )
        .bind(&key.partition_key)
        .bind(&key.sort_key)
        .bind(patch.status.map(|s| s.as_str()))
        .bind(attributes)
        .bind(&patch.result)
        .bind(&patch.updated_by)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| classify(key, e))?;

        match updated {
            Some(job) => Ok(Some(job)),
            None if self.exists(key).await? => {
                debug!("Status write skipped, job already terminal");
                Ok(None)
            },
            None => Err(ImportError::JobNotFound(key.id())),
        }
    }

    #[instrument(skip(self), fields(job_key = %key))]
    async fn increment_counters(&self, key: &JobKey, outcome: Outcome) -> ImportResult<ImportJob> {
        let (succeeded, failed) = match outcome {
            Outcome::Succeeded => (1_i64, 0_i64),
            Outcome::Failed => (0, 1),
        };

        sqlx::query_as::<_, ImportJob>(
            r#"
            UPDATE import_jobs SET
                processed_rows = processed_rows + 1,
                succeeded_rows = succeeded_rows + $3,
                failed_rows = failed_rows + $4,
                updated_at = NOW(),
                version = version + 1
            WHERE partition_key = $1 AND sort_key = $2
            RETURNING *
            "#,
        )
        .bind(&key.partition_key)
        .bind(&key.sort_key)
        .bind(succeeded)
        .bind(failed)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| classify(key, e))?
        .ok_or_else(|| ImportError::JobNotFound(key.id()))
    }

    async fn set_total_rows(&self, key: &JobKey, total_rows: i64) -> ImportResult<ImportJob> {
        let updated = sqlx::query_as::<_, ImportJob>(
            r#"
            UPDATE import_jobs SET total_rows = $3, updated_at = NOW(), version = version + 1
            WHERE partition_key = $1 AND sort_key = $2
              AND status NOT IN ('COMPLETED', 'FAILED')
            RETURNING *
            "#,
        )
        .bind(&key.partition_key)
        .bind(&key.sort_key)
        .bind(total_rows)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| classify(key, e))?;
        self.applied_or_current(key, updated).await
    }

    async fn record_totals(&self, key: &JobKey, totals: RowTotals) -> ImportResult<ImportJob> {
        let updated = sqlx::query_as::<_, ImportJob>(
            r#"
            UPDATE import_jobs SET
                total_rows = $3,
                processed_rows = $4,
                succeeded_rows = $5,
                failed_rows = $6,
                updated_at = NOW(),
                version = version + 1
            WHERE partition_key = $1 AND sort_key = $2
              AND status NOT IN ('COMPLETED', 'FAILED')
            RETURNING *
            "#,
        )
        .bind(&key.partition_key)
        .bind(&key.sort_key)
        .bind(totals.total)
        .bind(totals.processed)
        .bind(totals.succeeded)
        .bind(totals.failed)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| classify(key, e))?;
        self.applied_or_current(key, updated).await
    }

    async fn list_children(&self, parent: &JobKey) -> ImportResult<Vec<ImportJob>> {
        sqlx::query_as::<_, ImportJob>(
            "SELECT * FROM import_jobs WHERE parent_key = $1 ORDER BY sort_key",
        )
        .bind(parent.id())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| classify(parent, e))
    }

    #[instrument(skip(self, jobs), fields(count = jobs.len()))]
    async fn batch_write_raw(&self, jobs: &[ImportJob]) -> ImportResult<Vec<ImportJob>> {
        let mut unprocessed = Vec::new();
        for job in jobs {
            if let Err(err) = self.insert(&*self.pool, job).await {
                match classify(&job.key(), err) {
                    err if err.is_retryable() => {
                        warn!(job_key = %job.id, error = %err, "Batch write left item unprocessed");
                        unprocessed.push(job.clone());
                    },
                    err => return Err(err),
                }
            }
        }
        Ok(unprocessed)
    }

    #[instrument(skip(self, keys), fields(count = keys.len()))]
    async fn batch_delete_raw(&self, keys: &[JobKey]) -> ImportResult<Vec<JobKey>> {
        let mut unprocessed = Vec::new();
        for key in keys {
            let result = sqlx::query(
                "DELETE FROM import_jobs WHERE partition_key = $1 AND sort_key = $2",
            )
            .bind(&key.partition_key)
            .bind(&key.sort_key)
            .execute(&*self.pool)
            .await;

            if let Err(err) = result {
                match classify(key, err) {
                    err if err.is_retryable() => {
                        warn!(job_key = %key, error = %err, "Batch delete left item unprocessed");
                        unprocessed.push(key.clone());
                    },
                    err => return Err(err),
                }
            }
        }
        Ok(unprocessed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::model::{NewImportJob, RequestContext};
    use bulkport_common::ImportStatus;
    use serde_json::json;

    fn master(key: &JobKey) -> ImportJob {
        ImportJob::new(NewImportJob {
            key: key.clone(),
            code: "widgets.csv".into(),
            name: "widgets.csv".into(),
            entity_type: "widgets".into(),
            attributes: json!({"bucket": "imports", "key": "widgets.csv"}),
            parent_key: None,
            callback_token: None,
            context: RequestContext::default(),
        })
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_increment_is_atomic(pool: PgPool) -> ImportResult<()> {
        let store = PgJobStore::new(Arc::new(pool));
        let key = JobKey::new("CSV_IMPORT#acme", "widgets#01J");
        store.put(&master(&key)).await?;

        let mut handles = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store
                    .increment_counters(&key, Outcome::from_success(i % 4 != 0))
                    .await
            }));
        }
        for handle in handles {
            handle.await.map_err(|e| ImportError::Queue(e.to_string()))??;
        }

        let job = store.get(&key).await?.ok_or(ImportError::JobNotFound(key.id()))?;
        assert_eq!(job.processed_rows, 20);
        assert_eq!(job.succeeded_rows, 15);
        assert_eq!(job.failed_rows, 5);
        Ok(())
    }

    #[sqlx::test(migrations = "./migrations")]
    #[ignore = "requires DATABASE_URL"]
    async fn test_terminal_status_is_guarded(pool: PgPool) -> ImportResult<()> {
        let store = PgJobStore::new(Arc::new(pool));
        let key = JobKey::new("CSV_IMPORT#acme", "widgets#01J");
        store.put(&master(&key)).await?;

        let done = store.update(&key, &JobPatch::status(ImportStatus::Completed)).await?;
        assert!(done.is_some());

        let again = store.update(&key, &JobPatch::status(ImportStatus::Processing)).await?;
        assert!(again.is_none());

        let merged = store
            .update(&key, &JobPatch::default().with_attribute("note", json!("kept")))
            .await?
            .ok_or(ImportError::JobNotFound(key.id()))?;
        assert_eq!(merged.status, ImportStatus::Completed);
        assert_eq!(merged.attributes["bucket"], "imports");
        assert_eq!(merged.attributes["note"], "kept");
        Ok(())
    }
}
