//! Configuration management

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/bulkport";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

// ============================================================================
// Import Configuration Constants
// ============================================================================

/// Rows returned by the `loader` stage per call.
pub const DEFAULT_IMPORT_BATCH_LIMIT: usize = 10;

/// Attempts for batch store writes/deletes before leftovers are abandoned.
pub const DEFAULT_IMPORT_BATCH_MAX_RETRIES: u32 = 5;

/// Base delay for the batch retry backoff, doubled on every attempt.
pub const DEFAULT_IMPORT_BATCH_BASE_DELAY_MS: u64 = 100;

/// Bus channel carrying `import-status` notifications.
pub const DEFAULT_IMPORT_STATUS_CHANNEL: &str = "import_status";

/// Bus channel carrying `alarm` notifications.
pub const DEFAULT_IMPORT_ALARM_CHANNEL: &str = "import_alarm";

/// Bus channel carrying `command-status` notifications from command sinks.
pub const DEFAULT_IMPORT_COMMAND_CHANNEL: &str = "command_status";

/// Object store prefix for CSV members extracted from ZIP archives.
pub const DEFAULT_IMPORT_UNZIP_PREFIX: &str = "unzipped";

// ============================================================================
// Workflow Configuration Constants
// ============================================================================

pub const DEFAULT_WORKFLOW_ENDPOINT: &str = "http://localhost:8700";
pub const DEFAULT_WORKFLOW_CSV_PIPELINE: &str = "csv-import";
pub const DEFAULT_WORKFLOW_ZIP_PIPELINE: &str = "zip-import";
pub const DEFAULT_WORKFLOW_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub import: ImportConfig,
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

/// Engine tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportConfig {
    pub batch_limit: usize,
    pub batch_max_retries: u32,
    pub batch_base_delay_ms: u64,
    pub status_channel: String,
    pub alarm_channel: String,
    pub command_channel: String,
    pub unzip_prefix: String,
}

impl ImportConfig {
    pub fn batch_base_delay(&self) -> Duration {
        Duration::from_millis(self.batch_base_delay_ms)
    }
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            batch_limit: DEFAULT_IMPORT_BATCH_LIMIT,
            batch_max_retries: DEFAULT_IMPORT_BATCH_MAX_RETRIES,
            batch_base_delay_ms: DEFAULT_IMPORT_BATCH_BASE_DELAY_MS,
            status_channel: DEFAULT_IMPORT_STATUS_CHANNEL.to_string(),
            alarm_channel: DEFAULT_IMPORT_ALARM_CHANNEL.to_string(),
            command_channel: DEFAULT_IMPORT_COMMAND_CHANNEL.to_string(),
            unzip_prefix: DEFAULT_IMPORT_UNZIP_PREFIX.to_string(),
        }
    }
}

/// External workflow orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    pub endpoint: String,
    pub csv_pipeline: String,
    pub zip_pipeline: String,
    pub timeout_secs: u64,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_WORKFLOW_ENDPOINT.to_string(),
            csv_pipeline: DEFAULT_WORKFLOW_CSV_PIPELINE.to_string(),
            zip_pipeline: DEFAULT_WORKFLOW_ZIP_PIPELINE.to_string(),
            timeout_secs: DEFAULT_WORKFLOW_TIMEOUT_SECS,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

impl Config {
    /// Load configuration from `.env`, the environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_env();
        config.validate()?;

        Ok(config)
    }

    /// Read the environment without validating
    pub fn from_env() -> Self {
        Config {
            server: ServerConfig {
                host: env_string("BULKPORT_HOST", DEFAULT_SERVER_HOST),
                port: env_or("BULKPORT_PORT", DEFAULT_SERVER_PORT),
                shutdown_timeout_secs: env_or(
                    "BULKPORT_SHUTDOWN_TIMEOUT",
                    DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                ),
            },
            database: DatabaseConfig {
                url: env_string("DATABASE_URL", DEFAULT_DATABASE_URL),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: env_or(
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: env_or(
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: env_or(
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                ),
            },
            import: ImportConfig {
                batch_limit: env_or("IMPORT_BATCH_LIMIT", DEFAULT_IMPORT_BATCH_LIMIT),
                batch_max_retries: env_or(
                    "IMPORT_BATCH_MAX_RETRIES",
                    DEFAULT_IMPORT_BATCH_MAX_RETRIES,
                ),
                batch_base_delay_ms: env_or(
                    "IMPORT_BATCH_BASE_DELAY_MS",
                    DEFAULT_IMPORT_BATCH_BASE_DELAY_MS,
                ),
                status_channel: env_string("IMPORT_STATUS_CHANNEL", DEFAULT_IMPORT_STATUS_CHANNEL),
                alarm_channel: env_string("IMPORT_ALARM_CHANNEL", DEFAULT_IMPORT_ALARM_CHANNEL),
                command_channel: env_string(
                    "IMPORT_COMMAND_CHANNEL",
                    DEFAULT_IMPORT_COMMAND_CHANNEL,
                ),
                unzip_prefix: env_string("IMPORT_UNZIP_PREFIX", DEFAULT_IMPORT_UNZIP_PREFIX),
            },
            workflow: WorkflowConfig {
                endpoint: env_string("WORKFLOW_ENDPOINT", DEFAULT_WORKFLOW_ENDPOINT),
                csv_pipeline: env_string("WORKFLOW_CSV_PIPELINE", DEFAULT_WORKFLOW_CSV_PIPELINE),
                zip_pipeline: env_string("WORKFLOW_ZIP_PIPELINE", DEFAULT_WORKFLOW_ZIP_PIPELINE),
                timeout_secs: env_or("WORKFLOW_TIMEOUT_SECS", DEFAULT_WORKFLOW_TIMEOUT_SECS),
            },
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.database.url.is_empty() {
            anyhow::bail!("Database URL cannot be empty");
        }

        if self.database.max_connections == 0 {
            anyhow::bail!("Database max_connections must be greater than 0");
        }

        if self.database.min_connections > self.database.max_connections {
            anyhow::bail!(
                "Database min_connections ({}) cannot be greater than max_connections ({})",
                self.database.min_connections,
                self.database.max_connections
            );
        }

        if self.import.batch_limit == 0 {
            anyhow::bail!("Import batch limit must be greater than 0");
        }

        // pg_notify channel names are identifiers
        for channel in [
            &self.import.status_channel,
            &self.import.alarm_channel,
            &self.import.command_channel,
        ] {
            if channel.is_empty() || !channel.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                anyhow::bail!("Invalid notification channel name: {:?}", channel);
            }
        }

        if self.workflow.endpoint.is_empty() {
            anyhow::bail!("Workflow endpoint cannot be empty");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            import: ImportConfig::default(),
            workflow: WorkflowConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_config_is_valid() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_batch_limit() {
        let mut config = Config::default();
        config.import.batch_limit = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_channel() {
        let mut config = Config::default();
        config.import.status_channel = "import-status; DROP".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_pool_bounds() {
        let mut config = Config::default();
        config.database.min_connections = 20;
        assert!(config.validate().is_err());
    }

    #[test]
    #[serial]
    fn test_env_overrides() {
        std::env::set_var("IMPORT_BATCH_LIMIT", "25");
        std::env::set_var("WORKFLOW_CSV_PIPELINE", "csv-v2");
        std::env::set_var("BULKPORT_PORT", "not-a-port");

        let config = Config::from_env();

        std::env::remove_var("IMPORT_BATCH_LIMIT");
        std::env::remove_var("WORKFLOW_CSV_PIPELINE");
        std::env::remove_var("BULKPORT_PORT");

        assert_eq!(config.import.batch_limit, 25);
        assert_eq!(config.workflow.csv_pipeline, "csv-v2");
        assert_eq!(config.server.port, DEFAULT_SERVER_PORT);
    }
}
