//! Process startup: configuration, logging, the SFU manager and the HTTP
//! server, torn down in reverse on shutdown.

use anyhow::{Context, Result};
use huddle_sfu::engine::MediaWorker;
use huddle_sfu::SfuManager;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::Config;
use crate::http::{create_router, serve, AppState};
use crate::logging::init_logging;

/// Load and validate the configuration. Every validation error is reported.
pub fn load_config(config_file: Option<&str>) -> Result<Config> {
    let config = Config::load(config_file).context("Failed to load configuration")?;

    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s): {}",
            errors.len(),
            errors.join("; ")
        ));
    }

    Ok(config)
}

/// Run the gateway until SIGINT/SIGTERM.
///
/// The media engine workers are supplied by the embedder.
pub async fn start(config_file: Option<&str>, workers: Vec<Arc<dyn MediaWorker>>) -> Result<()> {
    let config = load_config(config_file)?;
    init_logging(&config.logging)?;
    info!("Huddle starting...");
    info!("HTTP address: {}", config.http_address());

    let listener = TcpListener::bind(config.http_address())
        .await
        .with_context(|| format!("Failed to bind {}", config.http_address()))?;
    run(listener, config, workers, shutdown_signal()).await
}

/// Serve on `listener` until `shutdown` resolves, then close every room
pub async fn run(
    listener: TcpListener,
    config: Config,
    workers: Vec<Arc<dyn MediaWorker>>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    if workers.is_empty() {
        return Err(anyhow::anyhow!("No media workers configured"));
    }

    let manager = SfuManager::new(config.sfu, workers);
    let router = create_router(AppState::new(
        Arc::clone(&manager),
        config.server.max_message_size,
    ));

    let served = serve(listener, router, shutdown).await;

    info!(rooms = manager.room_count(), "Closing rooms");
    manager.shutdown().await;
    info!("Huddle stopped");

    served.context("HTTP server failed")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
