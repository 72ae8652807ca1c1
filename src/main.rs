use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{error, info};

use rabbit_service_kit::config::{find_config_file, load_config_from, AppConfig};
use rabbit_service_kit::telemetry::init_logging;
use rabbit_service_kit::{ConnectionManager, Consumer, JournalHandlerFactory, SqliteStore};

#[tokio::main]
async fn main() -> Result<()> {
    init_logging("info");

    let config = match find_config_file() {
        Ok(path) => {
            info!("Loading configuration from {}", path.display());
            load_config_from(&path)?
        }
        Err(_) => AppConfig::from_env().context("Failed to load configuration from environment")?,
    };

    let store = SqliteStore::open(config.store.clone())
        .with_context(|| format!("Failed to open store '{}'", config.store.connection_string))?;
    info!("Store ready at {}", store.path().display());

    let connections = Arc::new(ConnectionManager::new(config.broker.clone()));
    info!("Connecting to {}", connections.config().redacted_uri());

    let consumer = Arc::new(Consumer::new(
        Arc::clone(&connections),
        config.consumer.clone(),
        JournalHandlerFactory::new(store),
    ));
    consumer.start().await?;
    info!("Consuming from '{}', press Ctrl-C to stop", config.consumer.queue);

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }

    info!("Shutting down");
    consumer.stop().await;
    Ok(())
}
