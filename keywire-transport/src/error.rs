//! Transport errors.

use thiserror::Error;

/// Errors surfaced by the client transport.
///
/// Almost all of these are terminal for the session that raised them.
/// A session that fails mid-handshake is abandoned, not retried.
#[derive(Debug, Error)]
pub enum TransportError {
    // --- Connection & Setup ---
    /// Failed to establish the WebSocket connection.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// A socket was asked to open a second time. Sockets are single
    /// use; this covers reopening after close as well.
    #[error("socket already opened")]
    AlreadyOpen,
    /// The requested namespace is not one this transport speaks.
    #[error("unknown socket namespace: {0}")]
    UnknownNamespace(String),
    /// The handshake did not complete within the configured window.
    #[error("handshake timed out")]
    HandshakeTimeout,

    // --- Protocol Violations (Terminal) ---
    /// Protocol-level error from keywire-core.
    #[error("protocol error: {0}")]
    Protocol(#[from] keywire_core::ProtocolError),

    // --- Lifecycle & Transport ---
    /// Operation attempted on a socket with no live connection.
    #[error("socket is not connected")]
    NotConnected,
    /// Sealed traffic attempted before the handshake reached `Ready`.
    #[error("secure channel is not ready")]
    NotReady,
    /// Internal session channel closed unexpectedly.
    #[error("session channel closed")]
    ChannelClosed,
    /// WebSocket error.
    #[error("websocket error: {0}")]
    WebSocket(String),
}
