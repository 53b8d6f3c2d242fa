#![forbid(unsafe_code)]

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;
use trystd::config::{Args, ServerConfig};
use trystd::metrics::{start_ops_server, HealthState};
use trystd::server::{run_cleanup, run_with_shutdown, ServerState};

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    let config: ServerConfig = args.into();

    // Validate configuration before starting
    if let Err(e) = config.validate() {
        anyhow::bail!("configuration error: {}", e);
    }

    let state = Arc::new(ServerState::new(config.clone()));

    let listener = TcpListener::bind(config.listen).await?;
    info!("bound to {}", config.listen);

    let health_state = HealthState::new();
    tokio::spawn({
        let state = state.clone();
        let health_state = health_state.clone();
        async move {
            if let Err(e) = start_ops_server(config.metrics_addr, state, health_state).await {
                tracing::warn!("ops server error: {}", e);
            }
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(run_cleanup(state.clone(), shutdown_rx.clone()));

    tokio::select! {
        result = run_with_shutdown(listener, state.clone(), shutdown_rx) => {
            if let Err(e) = result {
                tracing::error!("server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            health_state.set_ready(false);
            let _ = shutdown_tx.send(true);
            state.registry.close_all(
                tungstenite::protocol::frame::coding::CloseCode::Away,
                "server shutting down",
            );
        }
    }

    Ok(())
}
