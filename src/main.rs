use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use durable_queue::config::Settings;
use durable_queue::registry::QueueRegistry;
use durable_queue::store::{RedisStore, StoreRegistry};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    init_tracing();

    // Load configuration
    let settings = Settings::new()?;
    tracing::info!("Configuration loaded");

    // Register the durable store, if one is named
    let stores = StoreRegistry::new();
    let mut monitor = None;
    if let Some(name) = settings.queue.store.clone() {
        let store = Arc::new(RedisStore::new(settings.redis.clone())?);
        let shutdown_tx = store.shutdown_signal();
        let handle = store.spawn_monitor();
        stores.register(name.clone(), store.clone());
        tracing::info!(store = %name, url = %settings.redis.url, "Store registered");
        monitor = Some((store, shutdown_tx, handle));
    }

    let registry = QueueRegistry::new(settings.queue.clone(), stores);
    // A missing log file is not fatal; the engine runs without replay
    let _ = registry.setup();

    let queue = registry.default_queue().await;
    tracing::info!(
        channel = %queue.channel(),
        virtual_mode = queue.is_virtual(),
        "Queue ready"
    );

    shutdown_signal_handler().await;

    if let Err(e) = registry.shutdown().await {
        tracing::error!(error = %e, "Queue shutdown incomplete");
    }

    // Stop the connection monitor
    if let Some((store, shutdown_tx, handle)) = monitor {
        let _ = shutdown_tx.send(());
        let _ = handle.await;

        let health = store.health();
        tracing::info!(
            status = health.status.as_str(),
            total_reconnections = health.total_reconnections,
            "Store connection monitor stopped"
        );
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal_handler() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}
