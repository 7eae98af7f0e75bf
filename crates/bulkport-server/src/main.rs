//! Bulkport Server - Main entry point

use anyhow::Result;
use bulkport_common::logging::{init_logging, LogConfig};
use tracing::info;

use bulkport_server::{api, config::Config, ingest::StrategyRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    let log_config = LogConfig::builder()
        .log_file_prefix("bulkport-server".to_string())
        .filter_directives("bulkport_server=debug,tower_http=debug,apalis=info,sqlx=info".to_string())
        .build();

    // Environment variables take precedence
    let log_config = LogConfig::from_env().unwrap_or(log_config);

    let _guard = init_logging(&log_config)?;

    info!("Starting Bulkport Server");

    let config = Config::load()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    // Entity strategies are registered by applications embedding the library
    api::serve(config, StrategyRegistry::new(), Vec::new()).await
}
