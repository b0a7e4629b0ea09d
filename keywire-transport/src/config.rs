//! Session configuration.

use std::time::Duration;

/// The one namespace this transport speaks.
pub const NAMESPACE_SECURE: &str = "secure";

/// Port the reference server listens on.
pub const DEFAULT_PORT: u16 = 8001;

/// How long each handshake step may take before the session is
/// abandoned.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for one socket session.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Server host name or address.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Socket namespace, selecting the protocol spoken on the wire.
    pub namespace: String,
    /// Per-step handshake timeout.
    pub handshake_timeout: Duration,
}

impl SessionOptions {
    /// Options for the secure key exchange namespace.
    pub fn secure(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            namespace: NAMESPACE_SECURE.to_string(),
            handshake_timeout: HANDSHAKE_TIMEOUT,
        }
    }

    /// Override the namespace. Anything but [`NAMESPACE_SECURE`] will
    /// be refused when the socket opens.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Override the per-step handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// URL the socket connects to.
    pub fn endpoint_url(&self) -> String {
        format!("ws://{}:{}/ws/{}", self.host, self.port, self.namespace)
    }
}
