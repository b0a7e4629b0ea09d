//! Handshake state machine.
//!
//! Pure protocol logic: the machine consumes decoded events, validates
//! them against its current state, and hands outbound frames back to
//! the driver. It never touches a socket, so the whole exchange is
//! testable without I/O.
//!
//! Forward path:
//!
//! ```text
//! Idle -> KeysGenerated -> PeerKeysReceived -> KeysSent
//!      -> AwaitingAcceptance -> Ready
//! ```
//!
//! Any invalid event, bad key material or peer rejection lands in
//! `Failed`. `Failed` is terminal: the machine refuses every further
//! event and a new exchange starts from a fresh machine with fresh
//! keys.

use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::frame::Frame;
use crate::keys::{ForeignKeySet, LocalKeys};

/// Event name: client asks the peer for its public keys.
pub const GET_SERVER_KEYS: &str = "rsa:getServerKeys";
/// Event name: peer answers with its two public keys.
pub const SERVER_KEYS: &str = "rsa:serverKeys";
/// Event name: client submits its two public keys.
pub const SET_CLIENT_KEYS: &str = "rsa:setClientKeys";
/// Event name: peer's verdict on the client keys.
pub const ACCEPT_CLIENT_KEYS: &str = "rsa:acceptClientKeys";

/// Payload field holding an encryption public key PEM.
pub const ENCRYPT_KEY_FIELD: &str = "encryptKey";
/// Payload field holding a verification public key PEM.
pub const VERIFY_KEY_FIELD: &str = "verifyKey";

/// Verdict payload meaning the peer refused the client keys. Any other
/// verdict payload counts as acceptance.
pub const REJECTION: &str = "NO";
/// Verdict payload the reference peer sends on acceptance.
pub const ACCEPTANCE: &str = "OK";

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    /// Fresh machine, no key material yet.
    Idle,
    /// Both local pairs exist; waiting for the transport to open.
    KeysGenerated,
    /// The client-keys frame has been built and handed to the driver.
    KeysSent,
    /// Peer keys imported; the client-keys frame not yet built.
    PeerKeysReceived,
    /// Client keys written to the wire; waiting for the verdict.
    AwaitingAcceptance,
    /// Exchange complete in both directions. Sealed traffic may flow.
    Ready,
    /// Terminal. The exchange is abandoned.
    Failed,
}

/// Drives one key exchange from generated keys to a ready channel.
#[derive(Debug)]
pub struct HandshakeMachine {
    state: HandshakeState,
    local: Option<LocalKeys>,
    foreign: Option<ForeignKeySet>,
}

impl HandshakeMachine {
    /// A machine in `Idle` with no key material.
    pub fn new() -> Self {
        Self {
            state: HandshakeState::Idle,
            local: None,
            foreign: None,
        }
    }

    /// Current state.
    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// True once the exchange reached `Ready`.
    pub fn is_ready(&self) -> bool {
        self.state == HandshakeState::Ready
    }

    /// Local key material, present from `KeysGenerated` onward.
    pub fn local_keys(&self) -> Option<&LocalKeys> {
        self.local.as_ref()
    }

    /// Imported peer keys, present from `PeerKeysReceived` onward.
    pub fn foreign_keys(&self) -> Option<&ForeignKeySet> {
        self.foreign.as_ref()
    }

    /// Install freshly generated local keys. `Idle` -> `KeysGenerated`.
    ///
    /// Generation itself stays with the caller: it is CPU-bound and an
    /// async driver will want it on a blocking thread.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnexpectedEvent`] outside `Idle`.
    pub fn on_keys_generated(&mut self, keys: LocalKeys) -> Result<(), ProtocolError> {
        if self.state != HandshakeState::Idle {
            return Err(self.fail(ProtocolError::UnexpectedEvent));
        }
        self.local = Some(keys);
        self.state = HandshakeState::KeysGenerated;
        Ok(())
    }

    /// The transport is open. Returns the key request to send. The
    /// state stays `KeysGenerated`; nothing has been exchanged yet.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnexpectedEvent`] outside `KeysGenerated`.
    pub fn on_connect(&mut self) -> Result<Frame, ProtocolError> {
        if self.state != HandshakeState::KeysGenerated {
            return Err(self.fail(ProtocolError::UnexpectedEvent));
        }
        Ok(Frame::new(GET_SERVER_KEYS, Value::Null))
    }

    /// The peer's keys arrived. `KeysGenerated` -> `PeerKeysReceived`.
    ///
    /// Both PEMs import together or not at all; a failure leaves no
    /// partial peer key behind.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnexpectedEvent`] outside `KeysGenerated`
    /// - [`ProtocolError::MalformedFrame`] if a key field is absent
    /// - import failures per [`ForeignKeySet::import`]
    ///
    /// All failures are terminal.
    pub fn on_server_keys(&mut self, payload: &Value) -> Result<(), ProtocolError> {
        if self.state != HandshakeState::KeysGenerated {
            return Err(self.fail(ProtocolError::UnexpectedEvent));
        }
        let encrypt_pem = match payload.get(ENCRYPT_KEY_FIELD).and_then(Value::as_str) {
            Some(pem) => pem,
            None => return Err(self.fail(ProtocolError::MalformedFrame)),
        };
        let verify_pem = match payload.get(VERIFY_KEY_FIELD).and_then(Value::as_str) {
            Some(pem) => pem,
            None => return Err(self.fail(ProtocolError::MalformedFrame)),
        };
        match ForeignKeySet::import(encrypt_pem, verify_pem) {
            Ok(set) => {
                self.foreign = Some(set);
                self.state = HandshakeState::PeerKeysReceived;
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Build the client-keys frame. `PeerKeysReceived` -> `KeysSent`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnexpectedEvent`] outside `PeerKeysReceived`.
    pub fn client_keys_frame(&mut self) -> Result<Frame, ProtocolError> {
        if self.state != HandshakeState::PeerKeysReceived {
            return Err(self.fail(ProtocolError::UnexpectedEvent));
        }
        let frame = match self.local.as_ref() {
            Some(local) => {
                let mut data = Map::new();
                data.insert(
                    ENCRYPT_KEY_FIELD.to_string(),
                    Value::String(local.encryption_pem().as_str().to_string()),
                );
                data.insert(
                    VERIFY_KEY_FIELD.to_string(),
                    Value::String(local.signing_pem().as_str().to_string()),
                );
                Frame::new(SET_CLIENT_KEYS, Value::Object(data))
            }
            None => return Err(self.fail(ProtocolError::UnexpectedEvent)),
        };
        self.state = HandshakeState::KeysSent;
        Ok(frame)
    }

    /// The transport confirmed the client-keys write.
    /// `KeysSent` -> `AwaitingAcceptance`.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::UnexpectedEvent`] outside `KeysSent`.
    pub fn on_client_keys_sent(&mut self) -> Result<(), ProtocolError> {
        if self.state != HandshakeState::KeysSent {
            return Err(self.fail(ProtocolError::UnexpectedEvent));
        }
        self.state = HandshakeState::AwaitingAcceptance;
        Ok(())
    }

    /// The peer's verdict arrived. `AwaitingAcceptance` -> `Ready`,
    /// unless the verdict is [`REJECTION`].
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::UnexpectedEvent`] outside `AwaitingAcceptance`
    /// - [`ProtocolError::HandshakeRejected`] on a `"NO"` verdict
    pub fn on_accept_client_keys(&mut self, payload: &Value) -> Result<(), ProtocolError> {
        if self.state != HandshakeState::AwaitingAcceptance {
            return Err(self.fail(ProtocolError::UnexpectedEvent));
        }
        if payload.as_str() == Some(REJECTION) {
            return Err(self.fail(ProtocolError::HandshakeRejected));
        }
        self.state = HandshakeState::Ready;
        Ok(())
    }

    /// Abandon the exchange. Any state -> `Failed`.
    ///
    /// Used by drivers when the transport dies mid-handshake.
    pub fn abort(&mut self) {
        self.state = HandshakeState::Failed;
    }

    /// Record the failure and hand the error back for propagation.
    fn fail(&mut self, err: ProtocolError) -> ProtocolError {
        self.state = HandshakeState::Failed;
        err
    }
}

impl Default for HandshakeMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use serde_json::json;

    use super::*;

    // Two key sets shared across every test in this module.
    fn keys() -> &'static (LocalKeys, LocalKeys) {
        static KEYS: OnceLock<(LocalKeys, LocalKeys)> = OnceLock::new();
        KEYS.get_or_init(|| {
            (
                LocalKeys::generate().expect("client keygen"),
                LocalKeys::generate().expect("server keygen"),
            )
        })
    }

    fn server_keys_payload() -> Value {
        let (_, server) = keys();
        json!({
            "encryptKey": server.encryption_pem().as_str(),
            "verifyKey": server.signing_pem().as_str(),
        })
    }

    fn machine_with_keys() -> HandshakeMachine {
        let (client, _) = keys();
        let mut machine = HandshakeMachine::new();
        machine.on_keys_generated(client.clone()).expect("install");
        machine
    }

    #[test]
    fn test_full_handshake_reaches_ready() {
        let mut machine = HandshakeMachine::new();
        assert_eq!(machine.state(), HandshakeState::Idle);

        let (client, _) = keys();
        machine.on_keys_generated(client.clone()).expect("install");
        assert_eq!(machine.state(), HandshakeState::KeysGenerated);

        let request = machine.on_connect().expect("connect");
        assert_eq!(request.name(), GET_SERVER_KEYS);
        assert_eq!(machine.state(), HandshakeState::KeysGenerated);

        machine
            .on_server_keys(&server_keys_payload())
            .expect("server keys");
        assert_eq!(machine.state(), HandshakeState::PeerKeysReceived);
        assert!(machine.foreign_keys().is_some());

        let submit = machine.client_keys_frame().expect("frame");
        assert_eq!(submit.name(), SET_CLIENT_KEYS);
        assert_eq!(machine.state(), HandshakeState::KeysSent);

        machine.on_client_keys_sent().expect("sent");
        assert_eq!(machine.state(), HandshakeState::AwaitingAcceptance);

        machine
            .on_accept_client_keys(&json!(ACCEPTANCE))
            .expect("verdict");
        assert_eq!(machine.state(), HandshakeState::Ready);
        assert!(machine.is_ready());
    }

    #[test]
    fn test_client_keys_frame_carries_local_pems() {
        let (client, _) = keys();
        let mut machine = machine_with_keys();
        machine
            .on_server_keys(&server_keys_payload())
            .expect("server keys");
        let frame = machine.client_keys_frame().expect("frame");

        let data = frame.data();
        assert_eq!(
            data.get(ENCRYPT_KEY_FIELD).and_then(Value::as_str),
            Some(client.encryption_pem().as_str())
        );
        assert_eq!(
            data.get(VERIFY_KEY_FIELD).and_then(Value::as_str),
            Some(client.signing_pem().as_str())
        );
    }

    #[test]
    fn test_any_verdict_but_no_is_acceptance() {
        let mut machine = machine_with_keys();
        machine
            .on_server_keys(&server_keys_payload())
            .expect("server keys");
        machine.client_keys_frame().expect("frame");
        machine.on_client_keys_sent().expect("sent");
        machine
            .on_accept_client_keys(&json!({"note": "weird but accepted"}))
            .expect("verdict");
        assert!(machine.is_ready());
    }

    #[test]
    fn test_rejection_is_terminal() {
        let mut machine = machine_with_keys();
        machine
            .on_server_keys(&server_keys_payload())
            .expect("server keys");
        machine.client_keys_frame().expect("frame");
        machine.on_client_keys_sent().expect("sent");

        let err = machine
            .on_accept_client_keys(&json!(REJECTION))
            .expect_err("must fail");
        assert_eq!(err, ProtocolError::HandshakeRejected);
        assert_eq!(machine.state(), HandshakeState::Failed);
        assert!(!machine.is_ready());

        // Failed machines refuse everything afterward.
        let err = machine
            .on_accept_client_keys(&json!(ACCEPTANCE))
            .expect_err("must fail");
        assert_eq!(err, ProtocolError::UnexpectedEvent);
    }

    #[test]
    fn test_events_out_of_order_fail() {
        let mut machine = HandshakeMachine::new();
        let err = machine
            .on_server_keys(&server_keys_payload())
            .expect_err("must fail");
        assert_eq!(err, ProtocolError::UnexpectedEvent);
        assert_eq!(machine.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_connect_before_keys_fails() {
        let mut machine = HandshakeMachine::new();
        let err = machine.on_connect().expect_err("must fail");
        assert_eq!(err, ProtocolError::UnexpectedEvent);
        assert_eq!(machine.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_verdict_before_send_confirmation_fails() {
        let mut machine = machine_with_keys();
        machine
            .on_server_keys(&server_keys_payload())
            .expect("server keys");
        machine.client_keys_frame().expect("frame");
        // Skipped on_client_keys_sent.
        let err = machine
            .on_accept_client_keys(&json!(ACCEPTANCE))
            .expect_err("must fail");
        assert_eq!(err, ProtocolError::UnexpectedEvent);
        assert_eq!(machine.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_malformed_server_keys_payload_fails() {
        let (_, server) = keys();
        let mut machine = machine_with_keys();
        let err = machine
            .on_server_keys(&json!({"encryptKey": server.encryption_pem().as_str()}))
            .expect_err("must fail");
        assert_eq!(err, ProtocolError::MalformedFrame);
        assert_eq!(machine.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_unparseable_server_key_fails() {
        let mut machine = machine_with_keys();
        let err = machine
            .on_server_keys(&json!({
                "encryptKey": "garbage",
                "verifyKey": "garbage",
            }))
            .expect_err("must fail");
        assert_eq!(err, ProtocolError::MalformedKey);
        assert_eq!(machine.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_abort_is_terminal() {
        let mut machine = machine_with_keys();
        machine.abort();
        assert_eq!(machine.state(), HandshakeState::Failed);
        let err = machine.on_connect().expect_err("must fail");
        assert_eq!(err, ProtocolError::UnexpectedEvent);
    }

    #[test]
    fn test_double_key_install_fails() {
        let (client, _) = keys();
        let mut machine = machine_with_keys();
        let err = machine
            .on_keys_generated(client.clone())
            .expect_err("must fail");
        assert_eq!(err, ProtocolError::UnexpectedEvent);
    }
}
