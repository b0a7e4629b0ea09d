//! Secure channel API.
//!
//! The main public interface: establish a session and exchange keys,
//! then move sealed payloads.
//!
//! # Security Invariants
//!
//! - `SecureChannel` does not implement `Clone`
//! - A channel only ever exists in the `Ready` state; the constructor
//!   runs the whole handshake and fails instead of returning a partial
//!   channel
//! - Sealing and opening run off the async threads; private keys stay
//!   inside the channel

use keywire_core::handshake::{self, HandshakeMachine, HandshakeState};
use keywire_core::keys::LocalKeys;
use keywire_core::ProtocolError;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::SessionOptions;
use crate::dispatch::{self, RawEvent};
use crate::error::TransportError;
use crate::socket::FrameSocket;

/// Handshake-relevant occurrences, forwarded from handler context to
/// the establishing task.
enum HandshakeSignal {
    Connected,
    ServerKeys(Value),
    Verdict(Value),
    TransportFailed(String),
    Closed,
}

/// An established secure channel.
///
/// This type does not implement `Clone` to prevent state duplication.
pub struct SecureChannel {
    socket: FrameSocket,
    machine: HandshakeMachine,
}

impl SecureChannel {
    /// Connect, run the key exchange to completion, and return a ready
    /// channel.
    ///
    /// This performs:
    /// 1. Local key generation (on a blocking thread)
    /// 2. Socket connect and `connect` dispatch
    /// 3. `rsa:getServerKeys` -> `rsa:serverKeys` exchange
    /// 4. `rsa:setClientKeys` -> `rsa:acceptClientKeys` exchange
    ///
    /// `on_ready` runs exactly once, after the exchange reaches
    /// `Ready` and before this returns. On any failure the handshake
    /// is abandoned, the socket is closed and `on_ready` never runs.
    ///
    /// Each wait is bounded by the configured handshake timeout.
    ///
    /// # Errors
    ///
    /// - [`TransportError::ConnectionFailed`] /
    ///   [`TransportError::UnknownNamespace`] from the socket open
    /// - [`TransportError::HandshakeTimeout`] if a step stalls
    /// - [`TransportError::Protocol`] carrying
    ///   [`ProtocolError::HandshakeRejected`] when the peer answers
    ///   `"NO"`, or any other protocol failure
    /// - [`TransportError::NotConnected`] if the connection drops
    ///   mid-exchange
    pub async fn establish<F>(options: SessionOptions, on_ready: F) -> Result<Self, TransportError>
    where
        F: FnOnce(),
    {
        let keys = tokio::task::spawn_blocking(LocalKeys::generate)
            .await
            .map_err(|_| TransportError::ChannelClosed)??;
        debug!(
            encrypt_fp = %fingerprint_or_unknown(&keys, true),
            sign_fp = %fingerprint_or_unknown(&keys, false),
            "local key pairs generated"
        );

        let mut machine = HandshakeMachine::new();
        machine.on_keys_generated(keys)?;

        let mut socket = FrameSocket::new(options);
        let (signal_tx, mut signal_rx) = mpsc::unbounded_channel::<HandshakeSignal>();
        register_handshake_handlers(&socket, &signal_tx);
        drop(signal_tx);

        socket.open().await?;

        let step = socket.options().handshake_timeout;
        match run_handshake(&mut machine, &socket, &mut signal_rx, step).await {
            Ok(()) => {}
            Err(e) => {
                machine.abort();
                let _ = socket.close(true, None, "handshake failed");
                return Err(e);
            }
        }

        // Handshake handlers are done; put the defaults back so later
        // lifecycle events are logged and stale handshake frames are
        // reported as unhandled.
        socket.reset_handlers();

        let channel = Self { socket, machine };
        on_ready();
        Ok(channel)
    }

    /// Handshake state. Always `Ready` for a live channel.
    pub fn handshake_state(&self) -> HandshakeState {
        self.machine.state()
    }

    /// Session options the channel was established with.
    pub fn options(&self) -> &SessionOptions {
        self.socket.options()
    }

    /// True while the underlying connection is up.
    pub fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    /// Register (or replace) an event handler on the underlying
    /// socket.
    pub fn on<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Value, &SessionOptions, &RawEvent) + Send + Sync + 'static,
    {
        self.socket.on(name, handler);
    }

    /// Send a plain (unsealed) event. Returns the correlation id.
    ///
    /// # Errors
    ///
    /// See [`FrameSocket::send`].
    pub fn send(&self, name: &str, data: Value) -> Result<String, TransportError> {
        self.socket.send(name, data)
    }

    /// Seal every field of `fields` toward the peer and send the
    /// envelope under `name`. Returns the correlation id.
    ///
    /// Sealing runs on a blocking thread; the caller suspends without
    /// stalling the runtime.
    ///
    /// # Errors
    ///
    /// - [`TransportError::NotReady`] if the handshake state is not
    ///   `Ready`
    /// - [`TransportError::Protocol`] for sealing failures
    /// - [`TransportError::NotConnected`] if the connection is gone
    pub async fn send_secure(
        &self,
        name: &str,
        fields: Map<String, Value>,
    ) -> Result<String, TransportError> {
        let (encrypt, signing) = self.sealing_keys()?;
        let sealed = tokio::task::spawn_blocking(move || {
            keywire_core::envelope::seal_envelope(&encrypt, &signing, &fields)
        })
        .await
        .map_err(|_| TransportError::ChannelClosed)??;
        self.socket.send(name, Value::Object(sealed))
    }

    /// Open a sealed envelope received from the peer.
    ///
    /// # Errors
    ///
    /// - [`TransportError::NotReady`] if the handshake state is not
    ///   `Ready`
    /// - [`TransportError::Protocol`] for verification or decryption
    ///   failures
    pub async fn open_envelope(
        &self,
        sealed: Map<String, Value>,
    ) -> Result<Map<String, Value>, TransportError> {
        let (decrypt, verify) = self.opening_keys()?;
        let fields = tokio::task::spawn_blocking(move || {
            keywire_core::envelope::open_envelope(&decrypt, &verify, &sealed)
        })
        .await
        .map_err(|_| TransportError::ChannelClosed)??;
        Ok(fields)
    }

    /// Close the channel.
    ///
    /// With `remove_handlers`, registered handlers are dropped and the
    /// dispatcher returns to its defaults. After closing, every send
    /// fails with [`TransportError::NotConnected`].
    ///
    /// # Errors
    ///
    /// [`TransportError::NotConnected`] if already closed.
    pub fn close(
        &mut self,
        remove_handlers: bool,
        code: Option<u16>,
        reason: &str,
    ) -> Result<(), TransportError> {
        self.socket.close(remove_handlers, code, reason)
    }

    fn sealing_keys(
        &self,
    ) -> Result<(keywire_core::ForeignKey, keywire_core::LocalKeyPair), TransportError> {
        if !self.machine.is_ready() {
            return Err(TransportError::NotReady);
        }
        match (self.machine.foreign_keys(), self.machine.local_keys()) {
            (Some(foreign), Some(local)) => {
                Ok((foreign.encrypt_key().clone(), local.signing.clone()))
            }
            _ => Err(TransportError::NotReady),
        }
    }

    fn opening_keys(
        &self,
    ) -> Result<(keywire_core::LocalKeyPair, keywire_core::ForeignKey), TransportError> {
        if !self.machine.is_ready() {
            return Err(TransportError::NotReady);
        }
        match (self.machine.foreign_keys(), self.machine.local_keys()) {
            (Some(foreign), Some(local)) => {
                Ok((local.encryption.clone(), foreign.verify_key().clone()))
            }
            _ => Err(TransportError::NotReady),
        }
    }
}

fn register_handshake_handlers(
    socket: &FrameSocket,
    signal_tx: &mpsc::UnboundedSender<HandshakeSignal>,
) {
    let tx = signal_tx.clone();
    socket.on(dispatch::CONNECT, move |_payload, _options, _raw| {
        let _ = tx.send(HandshakeSignal::Connected);
    });
    let tx = signal_tx.clone();
    socket.on(handshake::SERVER_KEYS, move |payload, _options, _raw| {
        let _ = tx.send(HandshakeSignal::ServerKeys(payload.clone()));
    });
    let tx = signal_tx.clone();
    socket.on(handshake::ACCEPT_CLIENT_KEYS, move |payload, _options, _raw| {
        let _ = tx.send(HandshakeSignal::Verdict(payload.clone()));
    });
    let tx = signal_tx.clone();
    socket.on(dispatch::ERROR, move |_payload, _options, raw| {
        let detail = match raw {
            RawEvent::Error(detail) => detail.clone(),
            _ => "unknown".to_string(),
        };
        let _ = tx.send(HandshakeSignal::TransportFailed(detail));
    });
    let tx = signal_tx.clone();
    socket.on(dispatch::CLOSE, move |_payload, _options, _raw| {
        let _ = tx.send(HandshakeSignal::Closed);
    });
}

async fn run_handshake(
    machine: &mut HandshakeMachine,
    socket: &FrameSocket,
    signal_rx: &mut mpsc::UnboundedReceiver<HandshakeSignal>,
    step: std::time::Duration,
) -> Result<(), TransportError> {
    match next_signal(signal_rx, step).await? {
        HandshakeSignal::Connected => {}
        other => return Err(signal_failure(other)),
    }
    let request = machine.on_connect()?;
    socket.send_frame(request)?;
    debug!("server keys requested");

    match next_signal(signal_rx, step).await? {
        HandshakeSignal::ServerKeys(payload) => machine.on_server_keys(&payload)?,
        other => return Err(signal_failure(other)),
    }
    let submit = machine.client_keys_frame()?;
    socket.send_frame(submit)?;
    machine.on_client_keys_sent()?;
    debug!("client keys submitted");

    match next_signal(signal_rx, step).await? {
        HandshakeSignal::Verdict(payload) => machine.on_accept_client_keys(&payload)?,
        other => return Err(signal_failure(other)),
    }
    debug!("client keys accepted");
    Ok(())
}

async fn next_signal(
    signal_rx: &mut mpsc::UnboundedReceiver<HandshakeSignal>,
    step: std::time::Duration,
) -> Result<HandshakeSignal, TransportError> {
    match timeout(step, signal_rx.recv()).await {
        Ok(Some(signal)) => Ok(signal),
        Ok(None) => Err(TransportError::ChannelClosed),
        Err(_elapsed) => Err(TransportError::HandshakeTimeout),
    }
}

fn signal_failure(signal: HandshakeSignal) -> TransportError {
    match signal {
        HandshakeSignal::TransportFailed(detail) => {
            warn!(%detail, "transport failed mid-handshake");
            TransportError::WebSocket(detail)
        }
        HandshakeSignal::Closed => TransportError::NotConnected,
        // A protocol event arriving out of order.
        _ => TransportError::Protocol(ProtocolError::UnexpectedEvent),
    }
}

fn fingerprint_or_unknown(keys: &LocalKeys, encryption: bool) -> String {
    let pair = if encryption {
        &keys.encryption
    } else {
        &keys.signing
    };
    pair.fingerprint().unwrap_or_else(|_| "unknown".to_string())
}
