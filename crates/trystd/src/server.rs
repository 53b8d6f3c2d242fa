use crate::config::ServerConfig;
use crate::connection::handle_connection;
use crate::error::ServerError;
use crate::metrics::counters;
use crate::pairing::PairingManager;
use crate::queue::QueueManager;
use crate::registry::Registry;
use crate::router::Router;
use crate::security::SecurityManager;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};
use tungstenite::protocol::frame::coding::CloseCode;

/// Maximum number of connections that have not yet identified.
/// This prevents DoS by exhausting file descriptors before identification.
const MAX_PRE_AUTH_CONNECTIONS: usize = 1000;

/// Shared state for the rendezvous server.
pub struct ServerState {
    /// Runtime server configuration.
    pub config: ServerConfig,
    /// Registry of live identified connections.
    pub registry: Arc<Registry>,
    /// Per-mode matching queues.
    pub queue: Arc<QueueManager>,
    /// Pair relation and session lifecycle.
    pub pairing: Arc<PairingManager>,
    /// Admission and abuse enforcement.
    pub security: Arc<SecurityManager>,
    /// Frame router orchestrating the managers.
    pub router: Router,
    /// Process start, for uptime reporting.
    pub started_at: Instant,
    /// Semaphore to limit unidentified (pre-admission) connections.
    pub pre_auth_semaphore: Semaphore,
}

impl ServerState {
    /// Builds the managers and wires the router to them.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let queue = Arc::new(QueueManager::new(config.max_queue_size, config.queue_timeout));
        let pairing = Arc::new(PairingManager::new(config.mode_switch_timeout));
        let security = Arc::new(SecurityManager::new(&config));
        let router = Router::new(
            registry.clone(),
            queue.clone(),
            pairing.clone(),
            security.clone(),
            config.max_message_size,
            config.max_message_length,
        );
        Self {
            config,
            registry,
            queue,
            pairing,
            security,
            router,
            started_at: Instant::now(),
            pre_auth_semaphore: Semaphore::new(MAX_PRE_AUTH_CONNECTIONS),
        }
    }
}

/// Runs the accept loop until the process exits.
///
/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run(listener: TcpListener, state: Arc<ServerState>) -> Result<(), ServerError> {
    let (tx, rx) = watch::channel(false);
    // Keep the sender alive so the shutdown channel never signals.
    let _keepalive = tx;
    run_with_shutdown(listener, state, rx).await
}

/// Runs the accept loop until `shutdown` flips to true, then closes every
/// connection with a going-away code.
///
/// # Errors
///
/// Returns an error if the accept loop encounters an I/O failure.
pub async fn run_with_shutdown(
    listener: TcpListener,
    state: Arc<ServerState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ServerError> {
    let local_addr = listener.local_addr().map_err(ServerError::Io)?;
    info!("server listening on {}", local_addr);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        if state.registry.count() >= state.config.max_connections {
                            warn!("max connections reached, rejecting {}", addr);
                            drop(stream);
                            continue;
                        }

                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, addr, state).await {
                                tracing::debug!("connection from {} closed: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("failed to accept connection: {}", e);
                    }
                }
            }
            changed = shutdown.changed() => {
                // A dropped sender counts as a shutdown request.
                if changed.is_err() || *shutdown.borrow() {
                    info!("shutting down: closing {} connections", state.registry.count());
                    state.registry.close_all(CloseCode::Away, "server shutting down");
                    return Ok(());
                }
            }
        }
    }
}

/// Periodic background sweep: queue timeouts, expired mode-switch
/// handshakes, and stale security state. Runs until `shutdown` flips.
pub async fn run_cleanup(state: Arc<ServerState>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(state.config.cleanup_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let expired = state.queue.sweep();
                if !expired.is_empty() {
                    counters::queue_timeouts_total(expired.len() as u64);
                    info!(count = expired.len(), "swept timed-out queue entries");
                }
                let stale_switches = state.pairing.sweep_pending();
                if stale_switches > 0 {
                    tracing::debug!(count = stale_switches, "dropped expired mode-switch handshakes");
                }
                state.security.cleanup();
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
