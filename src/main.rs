//! NooBaaSource controller
//!
//! Main entry point. Sets up the Kubernetes client, starts the metrics and
//! health server, and runs the NooBaaSource controller until shutdown.

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use noobaa_source_controller::{
    config::{Config, LogFormat},
    controllers::{self, Context},
    metrics::{self, ServerState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Initialize tracing
    init_tracing(config.log_format);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting NooBaaSource controller");

    // Create Kubernetes client
    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let server = ServerState::new();
    let context = Arc::new(Context::new(client.clone(), &config, server.clone())?);

    // Start metrics server
    let mut metrics_handle = tokio::spawn(metrics::serve(config.metrics_port, server.clone()));
    info!("Metrics server starting on port {}", config.metrics_port);

    let shutdown = CancellationToken::new();
    let mut controller = tokio::spawn(controllers::run_noobaa_source_controller(
        client,
        context,
        shutdown.clone(),
    ));

    let result = tokio::select! {
        result = &mut controller => {
            error!("NooBaaSource controller exited unexpectedly");
            flatten(result)
        }
        result = &mut metrics_handle => {
            error!("Metrics server exited unexpectedly");
            server.set_stopping();
            shutdown.cancel();
            let _ = controller.await;
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(e.into()),
            }
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, stopping controller");
            server.set_stopping();
            shutdown.cancel();
            flatten(controller.await)
        }
    };

    metrics_handle.abort();
    match &result {
        Ok(()) => info!("NooBaaSource controller stopped"),
        Err(e) => warn!(error = %e, "NooBaaSource controller stopped with error"),
    }
    result
}

fn flatten(
    result: std::result::Result<noobaa_source_controller::Result<()>, tokio::task::JoinError>,
) -> anyhow::Result<()> {
    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.into()),
        Err(e) => Err(e.into()),
    }
}

/// Initialize tracing subscriber
fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,kube=warn,hyper=warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install CTRL+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
