//! HTTP transport for the pipeline stage contract
//!
//! [`serve`] also owns the process: it connects the real backends, starts the queue
//! worker and the notification listener, and serves until a shutdown signal.

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::error::ImportResult;
use crate::ingest::dispatcher::StageRequest;
use crate::ingest::notify::{spawn_pg_listener, PgNotificationBus};
use crate::ingest::postgres::PgJobStore;
use crate::ingest::queue::ApalisQueue;
use crate::ingest::workflow::HttpWorkflowClient;
use crate::ingest::zip_bridge::ZipFinalizationHook;
use crate::ingest::{Backends, ImportEngine, StrategyRegistry};
use crate::storage::{config::StorageConfig, Storage};

#[derive(Clone)]
pub struct AppState {
    pub engine: ImportEngine,
}

/// Run the engine against PostgreSQL, S3 and the HTTP orchestrator
pub async fn serve(
    config: Config,
    registry: StrategyRegistry,
    hooks: Vec<Arc<dyn ZipFinalizationHook>>,
) -> anyhow::Result<()> {
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout_secs))
        .idle_timeout(Duration::from_secs(config.database.idle_timeout_secs))
        .connect(&config.database.url)
        .await
        .context("Failed to connect to database")?;
    info!("Database connection pool established");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to run migrations: {}", e))?;
    apalis_postgres::PostgresStorage::setup(&pool)
        .await
        .context("Failed to set up job queue schema")?;
    info!("Database migrations completed");

    let storage = Storage::new(StorageConfig::from_env()?).await?;
    let queue = ApalisQueue::new(&pool);
    let shared_pool = Arc::new(pool.clone());

    if registry.table_names().is_empty() {
        tracing::warn!("No entity strategies registered, every import will be rejected");
    } else {
        info!(tables = ?registry.table_names(), "Entity strategies registered");
    }

    let engine = ImportEngine::new(
        &config.import,
        &config.workflow,
        registry,
        Backends {
            store: Arc::new(PgJobStore::new(shared_pool.clone())),
            objects: Arc::new(storage),
            bus: Arc::new(PgNotificationBus::new(shared_pool)),
            queue: Arc::new(queue.clone()),
            workflow: Arc::new(HttpWorkflowClient::new(&config.workflow)?),
        },
        hooks,
    );

    let _worker = queue.start_worker(engine.router.clone());
    let _listener = spawn_pg_listener(&pool, engine.notification_handlers()).await?;

    let app = create_router(AppState { engine });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(config.server.shutdown_timeout_secs))
        .await?;

    info!("Server shut down gracefully");
    Ok(())
}

async fn shutdown_signal(timeout_secs: u64) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
    }

    info!("Waiting up to {} seconds for connections to close", timeout_secs);
    tokio::time::sleep(Duration::from_secs(timeout_secs.min(5))).await;
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stages", post(run_stage))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Response {
    match state.engine.store().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "healthy",
                "database": "connected"
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Store health check failed: {:?}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "unhealthy",
                    "database": "disconnected"
                })),
            )
                .into_response()
        },
    }
}

async fn run_stage(
    State(state): State<AppState>,
    Json(request): Json<StageRequest>,
) -> ImportResult<Json<Value>> {
    let output = state.engine.dispatcher.dispatch(request).await?;
    Ok(Json(output))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ImportConfig, WorkflowConfig};
    use crate::ingest::memory::{MemoryBus, MemoryJobStore, MemoryQueue, RecordingWorkflow};
    use crate::storage::memory::MemoryObjectStore;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app() -> Router {
        let engine = ImportEngine::new(
            &ImportConfig::default(),
            &WorkflowConfig::default(),
            StrategyRegistry::new(),
            Backends {
                store: Arc::new(MemoryJobStore::new()),
                objects: Arc::new(MemoryObjectStore::new("imports")),
                bus: Arc::new(MemoryBus::new()),
                queue: Arc::new(MemoryQueue::new()),
                workflow: Arc::new(RecordingWorkflow::new()),
            },
            Vec::new(),
        );
        create_router(AppState { engine })
    }

    async fn post_stage(body: Value) -> (StatusCode, Value) {
        let response = app()
            .oneshot(
                Request::post("/stages")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    #[tokio::test]
    async fn test_health() {
        let response = app()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_stage_returns_null() {
        let (status, body) = post_stage(json!({"stage": "csv_loader", "input": {}})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, Value::Null);
    }

    #[tokio::test]
    async fn test_mapper_for_unregistered_table_is_rejected() {
        let (status, body) = post_stage(json!({
            "input": {
                "batchInput": {"attributes": {
                    "tableName": "ghost",
                    "tenantCode": "acme",
                    "sourceId": "CSV_IMPORT#acme#ghost#01J"
                }},
                "items": [{"sku": "g-1"}]
            }
        }))
        .await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"]["kind"], "NotFoundError");
    }

    #[tokio::test]
    async fn test_malformed_input_is_bad_request() {
        let (status, body) = post_stage(json!({"stage": "finalize", "input": {"resultCount": 1}})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"]["message"].as_str().unwrap().contains("Invalid finalize input"));
    }
}
