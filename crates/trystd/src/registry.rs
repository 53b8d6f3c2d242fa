use dashmap::DashMap;
use serde::Serialize;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::debug;
use tryst_common::ServerMessage;
use tungstenite::protocol::frame::coding::CloseCode;

/// Depth of each connection's outbound delivery channel.
pub const DELIVERY_QUEUE_DEPTH: usize = 256;

/// An instruction for a connection's owning task.
#[derive(Debug)]
pub enum Outbound {
    /// Deliver a serialized frame.
    Frame(String),
    /// Send a close frame and terminate the connection.
    Close {
        /// WebSocket close code.
        code: CloseCode,
        /// Terse close reason.
        reason: &'static str,
    },
}

/// Per-connection traffic counters, shared with the owning task.
#[derive(Debug, Default)]
pub struct ConnStats {
    /// Frames delivered to this connection.
    pub messages_sent: AtomicU64,
    /// Frames received from this connection.
    pub messages_received: AtomicU64,
    /// Bytes delivered to this connection.
    pub bytes_sent: AtomicU64,
    /// Bytes received from this connection.
    pub bytes_received: AtomicU64,
}

/// Handle held in the connection table — everything needed to reach one
/// identified client.
#[derive(Debug, Clone)]
pub struct ConnHandle {
    /// Channel into the connection's owning task.
    pub tx: mpsc::Sender<Outbound>,
    /// Remote client IP as established at admission.
    pub ip: IpAddr,
    /// When this binding was registered (eviction guard).
    pub bound_at: Instant,
    /// Shared traffic counters.
    pub stats: Arc<ConnStats>,
}

impl ConnHandle {
    /// Asks the owning task to close the connection.
    pub fn close(&self, code: CloseCode, reason: &'static str) {
        let _ = self.tx.try_send(Outbound::Close { code, reason });
    }
}

/// Aggregate connection metrics.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct RegistryMetrics {
    /// Live identified connections.
    pub connections: usize,
    /// Total frames delivered.
    pub messages_sent: u64,
    /// Total frames received.
    pub messages_received: u64,
    /// Total bytes delivered.
    pub bytes_sent: u64,
    /// Total bytes received.
    pub bytes_received: u64,
}

/// Registry of live identified connections, keyed by user id.
///
/// Delivery is single-writer: frames for one recipient are handed to that
/// connection's task in call order through a bounded channel.
#[derive(Debug, Default)]
pub struct Registry {
    conns: DashMap<String, ConnHandle>,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a binding, returning any previous handle for the same user.
    ///
    /// The caller closes the returned handle with a normal-closure code: only
    /// one connection per user id exists at a time.
    #[must_use]
    pub fn insert(&self, user_id: &str, handle: ConnHandle) -> Option<ConnHandle> {
        self.conns.insert(user_id.to_string(), handle)
    }

    /// Removes a binding only if it is the one registered at `bound_at`.
    ///
    /// A task whose binding was replaced by a re-identify must not unbind its
    /// successor.
    pub fn remove_if(&self, user_id: &str, bound_at: Instant) {
        self.conns.remove_if(user_id, |_k, v| v.bound_at == bound_at);
    }

    /// Looks up a connection handle.
    pub fn get(&self, user_id: &str) -> Option<ConnHandle> {
        self.conns.get(user_id).map(|entry| entry.value().clone())
    }

    /// True when the user currently has a live binding.
    pub fn contains(&self, user_id: &str) -> bool {
        self.conns.contains_key(user_id)
    }

    /// True when `bound_at` still owns the binding for `user_id`.
    pub fn owns(&self, user_id: &str, bound_at: Instant) -> bool {
        self.conns
            .get(user_id)
            .is_some_and(|entry| entry.bound_at == bound_at)
    }

    /// The remote IP recorded for a user's connection.
    pub fn ip_of(&self, user_id: &str) -> Option<IpAddr> {
        self.conns.get(user_id).map(|entry| entry.ip)
    }

    /// Number of live identified connections.
    pub fn count(&self) -> usize {
        self.conns.len()
    }

    /// Serializes and delivers a message to one user.
    ///
    /// Returns `false` when the user has no binding or the delivery channel
    /// is full or closed.
    pub fn send_to_user(&self, user_id: &str, message: &ServerMessage) -> bool {
        let Some(handle) = self.get(user_id) else {
            return false;
        };
        let Ok(json) = serde_json::to_string(message) else {
            debug!(user_id, "failed to serialize outbound frame");
            return false;
        };
        let bytes = json.len() as u64;
        match handle.tx.try_send(Outbound::Frame(json)) {
            Ok(()) => {
                handle.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                handle.stats.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
                true
            }
            Err(e) => {
                debug!(user_id, "outbound delivery failed: {}", e);
                false
            }
        }
    }

    /// Best-effort delivery to every connection except the excluded users.
    pub fn broadcast_to_all(&self, message: &ServerMessage, exclude: &[&str]) {
        let Ok(json) = serde_json::to_string(message) else {
            debug!("failed to serialize broadcast frame");
            return;
        };
        let bytes = json.len() as u64;
        for entry in self.conns.iter() {
            if exclude.contains(&entry.key().as_str()) {
                continue;
            }
            if entry.value().tx.try_send(Outbound::Frame(json.clone())).is_ok() {
                entry.value().stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                entry.value().stats.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
                self.messages_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
            }
        }
    }

    /// Asks the owning task of `user_id`'s connection to close it.
    pub fn close_user(&self, user_id: &str, code: CloseCode, reason: &'static str) -> bool {
        match self.get(user_id) {
            Some(handle) => {
                handle.close(code, reason);
                true
            }
            None => false,
        }
    }

    /// Asks every connection to close; used during graceful shutdown.
    pub fn close_all(&self, code: CloseCode, reason: &'static str) {
        for entry in self.conns.iter() {
            entry.value().close(code, reason);
        }
    }

    /// Records an inbound frame against the global counters.
    pub fn record_inbound(&self, bytes: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Aggregate traffic metrics.
    pub fn metrics(&self) -> RegistryMetrics {
        RegistryMetrics {
            connections: self.conns.len(),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
        }
    }
}
