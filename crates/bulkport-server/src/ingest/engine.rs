//! Wiring of the import engine
//!
//! Every component takes its collaborators as trait objects. [`ImportEngine`]
//! builds them all once from a set of [`Backends`], so the binary and the tests
//! differ only in which backends they pass in.

use std::collections::HashMap;
use std::sync::Arc;

use super::archive::ZipExtractor;
use super::counters::CounterAggregator;
use super::csv::CsvIngestor;
use super::dispatcher::StageDispatcher;
use super::notify::{NotificationBus, NotificationHandler, StatusConsumer, StatusPublisher};
use super::queue::JobQueue;
use super::service::ImportService;
use super::store::{JobStore, RetryPolicy};
use super::strategy::StrategyRegistry;
use super::worker::{CommandStatusConsumer, CsvMasterHandler, QueueRouter, RecordWorker, ZipMasterHandler};
use super::workflow::WorkflowClient;
use super::zip_bridge::{ZipBridge, ZipFinalizationHook};
use crate::config::{ImportConfig, WorkflowConfig};
use crate::storage::ObjectStore;

/// External collaborators
#[derive(Clone)]
pub struct Backends {
    pub store: Arc<dyn JobStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub bus: Arc<dyn NotificationBus>,
    pub queue: Arc<dyn JobQueue>,
    pub workflow: Arc<dyn WorkflowClient>,
}

#[derive(Clone)]
pub struct ImportEngine {
    pub service: ImportService,
    pub dispatcher: StageDispatcher,
    pub router: Arc<QueueRouter>,
    pub counters: CounterAggregator,
    pub publisher: StatusPublisher,
    status_consumer: StatusConsumer,
    command_consumer: CommandStatusConsumer,
    store: Arc<dyn JobStore>,
    status_channel: String,
    command_channel: String,
}

impl ImportEngine {
    pub fn new(
        import: &ImportConfig,
        workflow: &WorkflowConfig,
        registry: StrategyRegistry,
        backends: Backends,
        hooks: Vec<Arc<dyn ZipFinalizationHook>>,
    ) -> Self {
        let registry = Arc::new(registry);
        let retry = RetryPolicy::new(import.batch_max_retries, import.batch_base_delay());

        let publisher = StatusPublisher::new(
            backends.store.clone(),
            backends.bus.clone(),
            import.status_channel.clone(),
            import.alarm_channel.clone(),
        );
        let counters = CounterAggregator::new(backends.store.clone(), publisher.clone(), retry);
        let ingestor = CsvIngestor::new(backends.objects.clone());

        let service = ImportService::new(
            backends.store.clone(),
            registry.clone(),
            backends.queue.clone(),
            publisher.clone(),
            ingestor.clone(),
            retry,
        );

        let zip = ZipBridge::new(service.clone(), counters.clone(), hooks);
        let dispatcher = StageDispatcher::new(
            registry.clone(),
            service.clone(),
            ingestor,
            counters.clone(),
            zip,
            import.batch_limit,
        );

        let router = QueueRouter::new(
            RecordWorker::new(
                backends.store.clone(),
                registry.clone(),
                publisher.clone(),
                counters.clone(),
            ),
            CsvMasterHandler::new(
                backends.store.clone(),
                registry,
                publisher.clone(),
                backends.workflow.clone(),
                workflow.csv_pipeline.clone(),
            ),
            ZipMasterHandler::new(
                backends.store.clone(),
                publisher.clone(),
                ZipExtractor::new(backends.objects.clone(), import.unzip_prefix.clone()),
                backends.workflow.clone(),
                workflow.zip_pipeline.clone(),
            ),
        );

        Self {
            status_consumer: StatusConsumer::new(backends.store.clone(), backends.workflow),
            command_consumer: CommandStatusConsumer::new(publisher.clone(), counters.clone()),
            service,
            dispatcher,
            router: Arc::new(router),
            counters,
            publisher,
            store: backends.store,
            status_channel: import.status_channel.clone(),
            command_channel: import.command_channel.clone(),
        }
    }

    pub fn store(&self) -> Arc<dyn JobStore> {
        self.store.clone()
    }

    pub fn status_consumer(&self) -> &StatusConsumer {
        &self.status_consumer
    }

    pub fn command_consumer(&self) -> &CommandStatusConsumer {
        &self.command_consumer
    }

    /// Consumers keyed by the bus channel they listen on
    pub fn notification_handlers(&self) -> HashMap<String, Arc<dyn NotificationHandler>> {
        let mut handlers: HashMap<String, Arc<dyn NotificationHandler>> = HashMap::new();
        handlers.insert(self.status_channel.clone(), Arc::new(self.status_consumer.clone()));
        handlers.insert(self.command_channel.clone(), Arc::new(self.command_consumer.clone()));
        handlers
    }
}
