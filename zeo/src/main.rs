#![cfg_attr(test, allow(clippy::disallowed_methods))]
// Forbid unwrap() in production code to prevent panics from corrupt data.
// Test code is allowed to use unwrap() for convenience.
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeo::blob::BlobLayout;
use zeo::config::ServerConfig;
use zeo::server::{HubConfig, MemoryStorage, StorageServer};

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zeo=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration from environment variables
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Loaded configuration: address={}, storage={}, read_only={}",
        config.address,
        config.storage_name,
        config.read_only
    );

    let mut storage = MemoryStorage::new(config.storage_name.clone()).with_read_only(config.read_only);
    if let Some(dir) = &config.blob_dir {
        match BlobLayout::open(dir) {
            Ok(layout) => {
                tracing::info!("blobs stored under {}", dir.display());
                storage = storage.with_blobs(layout);
            }
            Err(e) => {
                tracing::error!("Failed to open blob directory {}: {e}", dir.display());
                std::process::exit(1);
            }
        }
    }

    let mut server = StorageServer::new(HubConfig::from(&config));
    server.add_storage(config.storage_name.clone(), Arc::new(storage));

    let running = server.bind(&config.address).await.unwrap_or_else(|e| {
        tracing::error!("Failed to bind: {e}");
        std::process::exit(1);
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
    tracing::info!("shutting down");
    running.shutdown().await;
}
