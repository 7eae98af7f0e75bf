//! Import job orchestration
//!
//! Job records move `CREATED → QUEUED → PROCESSING → COMPLETED | FAILED`. Single
//! records are processed by [`worker::RecordWorker`]. CSV and ZIP files become
//! master jobs that fan out into children through the external orchestrator, which
//! calls back into [`dispatcher::StageDispatcher`] once per pipeline stage. Masters
//! finish when [`counters::CounterAggregator`] has seen every child.

pub mod archive;
pub mod counters;
pub mod csv;
pub mod dispatcher;
pub mod engine;
pub mod memory;
pub mod model;
pub mod notify;
pub mod postgres;
pub mod queue;
pub mod service;
pub mod store;
pub mod strategy;
pub mod worker;
pub mod workflow;
pub mod zip_bridge;

pub use engine::{Backends, ImportEngine};
pub use model::{ImportJob, JobPatch, Outcome, RequestContext, RowTotals};
pub use store::{JobStore, RetryPolicy};
pub use strategy::{EntityProfile, StrategyRegistry};
