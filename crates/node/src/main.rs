//! cellstore-node: entry point for a cell storage server.
//!
//! Loads config, opens the content store, wires the cell request
//! processor and its expiry reaper, then serves batches over HTTP on the
//! configured listen address.

use cellstore_cell::reaper::spawn_reaper;
use cellstore_cell::CellRequestProcessor;
use cellstore_net::CellServer;
use cellstore_storage::{ContentStore, FsyncPolicy};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    cellstore_metrics::init_tracing();

    // First CLI arg is the YAML config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config.yaml".to_string());

    let config = cellstore_config::load_from_file(std::path::Path::new(&config_path))
        .unwrap_or_else(|e| {
            tracing::warn!(
                "failed to load config from {}: {}, using defaults",
                config_path,
                e
            );
            cellstore_config::load_from_str("listen: \"127.0.0.1:7080\"\n")
                .expect("hardcoded default config must parse")
        });

    let fsync = FsyncPolicy::from_str_config(&config.storage.fsync);
    let store = ContentStore::open(&config.storage.data_dir, fsync)?;
    tracing::info!(
        data_dir = %config.storage.data_dir.display(),
        elements = store.element_count(),
        files = store.heads().count(),
        "content store opened"
    );
    let store = Arc::new(RwLock::new(store));

    let processor = Arc::new(CellRequestProcessor::from_config(store, &config));

    if config.locks.reaper_interval_secs > 0 {
        spawn_reaper(
            processor.clone(),
            Duration::from_secs(config.locks.reaper_interval_secs),
        );
    } else {
        tracing::info!("reaper disabled");
    }

    if let Some(metrics_port) = config.metrics_port {
        let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
        tokio::spawn(async move {
            if let Err(e) = cellstore_metrics::serve_metrics(metrics_addr).await {
                tracing::warn!("metrics server failed: {}", e);
            }
        });
    }

    let listener = TcpListener::bind(config.listen).await?;
    let server = CellServer::new(processor.clone()).with_body_limit(config.max_request_bytes);

    // Serve with graceful shutdown on Ctrl+C
    tokio::select! {
        result = server.serve(listener) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("received Ctrl+C, shutting down");
        }
    }

    let mut store = processor.store().write().await;
    if let Err(e) = store.sync() {
        tracing::warn!("final sync failed: {}", e);
    }
    tracing::info!(wal_entries = store.wal_entries_written(), "content store closed");
    Ok(())
}
