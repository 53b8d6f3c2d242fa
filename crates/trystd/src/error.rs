use thiserror::Error;

/// Errors that can occur while serving a rendezvous connection.
#[derive(Error, Debug)]
pub enum ServerError {
    /// WebSocket transport error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The connection was closed by the remote peer.
    #[error("connection closed")]
    ConnectionClosed,
    /// The client violated the framing protocol (undecodable JSON).
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
}
