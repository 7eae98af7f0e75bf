//! Bulkport Server Library
//!
//! Bulk data import engine for multi-tenant services.
//!
//! # Overview
//!
//! Bulkport turns create requests, CSV files and ZIP archives of CSV files into
//! tracked import jobs:
//!
//! - **Job records**: one per entity write, keyed by tenant and moved through
//!   `CREATED → QUEUED → PROCESSING → COMPLETED | FAILED`
//! - **Master jobs**: one per CSV or ZIP file, aggregating the outcome of their children
//! - **Entity strategies**: per-table transform, validate, compare and map hooks
//!   registered by the embedding application
//! - **Pipelines**: large files are paged through an external workflow orchestrator
//!   that calls back into the `/stages` endpoint
//!
//! ## Framework Stack
//!
//! - **Axum**: stage callback endpoint and health check
//! - **SQLx**: PostgreSQL job store and notification bus
//! - **apalis**: durable job queue
//! - **aws-sdk-s3**: source files and extracted archive members
//!
//! # Example
//!
//! ```no_run
//! use bulkport_server::{api, config::Config, ingest::StrategyRegistry};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load()?;
//!     api::serve(config, StrategyRegistry::new(), Vec::new()).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod error;
pub mod ingest;
pub mod storage;

pub use error::{ImportError, ImportResult};
