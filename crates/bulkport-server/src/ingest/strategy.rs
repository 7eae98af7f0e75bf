//! Per-entity import strategies
//!
//! Each importable table registers an [`EntityProfile`] pairing two capability
//! sets: an [`ImportStrategy`] that turns raw input into validated attributes, and a
//! [`ProcessStrategy`] that reconciles those attributes against the target system.
//! The [`StrategyRegistry`] is built once at startup and injected wherever a lookup
//! is needed.

use async_trait::async_trait;
use bulkport_common::JobKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ImportError, ImportResult};

#[async_trait]
pub trait ImportStrategy: Send + Sync {
    /// Raw row or request body into record attributes
    async fn transform(&self, input: Value) -> ImportResult<Value>;

    /// Reject attributes that must not be imported
    async fn validate(&self, attributes: &Value) -> ImportResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComparisonStatus {
    /// Target already holds identical data
    Equal,
    NotExist,
    Changed,
}

impl ComparisonStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonStatus::Equal => "EQUAL",
            ComparisonStatus::NotExist => "NOT_EXIST",
            ComparisonStatus::Changed => "CHANGED",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub status: ComparisonStatus,
    /// Current target-side data when it exists
    pub existing: Option<Value>,
}

impl Comparison {
    pub fn new(status: ComparisonStatus, existing: Option<Value>) -> Self {
        Self { status, existing }
    }
}

/// Write sent to a command sink
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "payload", rename_all = "lowercase")]
pub enum WritePayload {
    Create(Value),
    Update(Value),
}

/// How a command sink answered a write
#[derive(Debug, Clone, PartialEq)]
pub enum CommandReceipt {
    /// Applied; carries the sink's output
    Settled(Value),
    /// Accepted for asynchronous execution; settlement arrives later as a
    /// `command-status` notification referencing the submitting job
    Pending { command_id: String },
}

#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn submit(&self, source: &JobKey, payload: WritePayload) -> ImportResult<CommandReceipt>;
}

#[async_trait]
pub trait ProcessStrategy: Send + Sync {
    async fn compare(&self, attributes: &Value, tenant: &str) -> ImportResult<Comparison>;

    async fn map(
        &self,
        status: ComparisonStatus,
        attributes: &Value,
        tenant: &str,
        existing: Option<&Value>,
    ) -> ImportResult<WritePayload>;

    fn command_sink(&self) -> Arc<dyn CommandSink>;
}

/// Strategies registered for one table
#[derive(Clone)]
pub struct EntityProfile {
    pub table_name: String,
    pub import: Arc<dyn ImportStrategy>,
    pub process: Arc<dyn ProcessStrategy>,
}

impl EntityProfile {
    pub fn new(
        table_name: impl Into<String>,
        import: Arc<dyn ImportStrategy>,
        process: Arc<dyn ProcessStrategy>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            import,
            process,
        }
    }
}

#[derive(Clone, Default)]
pub struct StrategyRegistry {
    profiles: HashMap<String, EntityProfile>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a profile, replacing any earlier one for the same table
    pub fn register(mut self, profile: EntityProfile) -> Self {
        self.profiles.insert(profile.table_name.clone(), profile);
        self
    }

    pub fn get(&self, table_name: &str) -> ImportResult<&EntityProfile> {
        self.profiles
            .get(table_name)
            .ok_or_else(|| ImportError::StrategyNotFound(table_name.to_string()))
    }

    pub fn import_strategy(&self, table_name: &str) -> ImportResult<Arc<dyn ImportStrategy>> {
        self.get(table_name).map(|p| Arc::clone(&p.import))
    }

    pub fn process_strategy(&self, table_name: &str) -> ImportResult<Arc<dyn ProcessStrategy>> {
        self.get(table_name).map(|p| Arc::clone(&p.process))
    }

    pub fn contains(&self, table_name: &str) -> bool {
        self.profiles.contains_key(table_name)
    }

    pub fn table_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.profiles.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Passthrough;

    #[async_trait]
    impl ImportStrategy for Passthrough {
        async fn transform(&self, input: Value) -> ImportResult<Value> {
            Ok(input)
        }

        async fn validate(&self, _attributes: &Value) -> ImportResult<()> {
            Ok(())
        }
    }

    struct NoopSink;

    #[async_trait]
    impl CommandSink for NoopSink {
        async fn submit(&self, _source: &JobKey, _payload: WritePayload) -> ImportResult<CommandReceipt> {
            Ok(CommandReceipt::Settled(Value::Null))
        }
    }

    struct AlwaysNew;

    #[async_trait]
    impl ProcessStrategy for AlwaysNew {
        async fn compare(&self, _attributes: &Value, _tenant: &str) -> ImportResult<Comparison> {
            Ok(Comparison::new(ComparisonStatus::NotExist, None))
        }

        async fn map(
            &self,
            _status: ComparisonStatus,
            attributes: &Value,
            _tenant: &str,
            _existing: Option<&Value>,
        ) -> ImportResult<WritePayload> {
            Ok(WritePayload::Create(attributes.clone()))
        }

        fn command_sink(&self) -> Arc<dyn CommandSink> {
            Arc::new(NoopSink)
        }
    }

    fn registry() -> StrategyRegistry {
        StrategyRegistry::new()
            .register(EntityProfile::new("widgets", Arc::new(Passthrough), Arc::new(AlwaysNew)))
            .register(EntityProfile::new("gadgets", Arc::new(Passthrough), Arc::new(AlwaysNew)))
    }

    #[test]
    fn test_lookup() {
        let registry = registry();
        assert!(registry.contains("widgets"));
        assert_eq!(registry.table_names(), vec!["gadgets", "widgets"]);
        assert!(registry.import_strategy("widgets").is_ok());
    }

    #[test]
    fn test_missing_strategy_is_not_found() {
        let registry = registry();
        match registry.process_strategy("ghost") {
            Err(ImportError::StrategyNotFound(name)) => assert_eq!(name, "ghost"),
            _ => panic!("expected StrategyNotFound"),
        }
    }

    #[tokio::test]
    async fn test_profile_strategies_are_callable() {
        let registry = registry();
        let profile = registry.get("widgets").unwrap();
        let attrs = profile.import.transform(json!({"sku": "w-1"})).await.unwrap();
        let cmp = profile.process.compare(&attrs, "acme").await.unwrap();
        let payload = profile.process.map(cmp.status, &attrs, "acme", None).await.unwrap();
        assert_eq!(payload, WritePayload::Create(json!({"sku": "w-1"})));
    }

    #[test]
    fn test_payload_wire_format() {
        let value = serde_json::to_value(WritePayload::Update(json!({"a": 1}))).unwrap();
        assert_eq!(value, json!({"operation": "update", "payload": {"a": 1}}));
    }
}
