//! ReCopyFast collaboration server.
//!
//! Configured through `RECOPY_*` environment variables; log level through
//! `RUST_LOG`.

use log::{error, info};
use std::sync::Arc;

use recopy_collab::config::{DispatcherConfig, ServerConfig};
use recopy_collab::conflict::{ConflictDetector, DisjointRangeMerge};
use recopy_collab::server::CollabServer;
use recopy_collab::storage::{RocksStore, StoreConfig};
use recopy_collab::webhook::{RetryScheduler, WebhookDispatcher};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let server_config = ServerConfig::from_env()?;
    let dispatcher_config = DispatcherConfig::from_env()?;
    info!("Starting ReCopyFast collaboration server...");

    let store = Arc::new(RocksStore::open(StoreConfig::at(&server_config.storage_path))?);

    let dispatcher = WebhookDispatcher::new(store.clone(), dispatcher_config)?;
    let retries = RetryScheduler::start(dispatcher.clone());

    let detector = ConflictDetector::new(store.clone(), store.clone())
        .with_policy(DisjointRangeMerge)
        .with_listener(Arc::new(dispatcher));
    let server = CollabServer::new(server_config, Arc::new(detector));

    info!("Press Ctrl+C to stop.");
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {e}");
            }
        }
        _ = shutdown => {}
    }

    retries.stop().await;
    if let Err(e) = store.sync() {
        error!("Failed to flush store: {e}");
    }
    info!("Stopped.");
    Ok(())
}
