use std::sync::Arc;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, warn};

use keywire_core::envelope::{open_envelope, seal_envelope};
use keywire_core::handshake::{
    ACCEPTANCE, ACCEPT_CLIENT_KEYS, ENCRYPT_KEY_FIELD, GET_SERVER_KEYS, REJECTION, SERVER_KEYS,
    SET_CLIENT_KEYS, VERIFY_KEY_FIELD,
};
use keywire_core::{ForeignKeySet, Frame, LocalKeys, ProtocolError};

// Upgrade path. Requests for any other path are refused with a 404
// before the WebSocket handshake completes.
pub const SECURE_PATH: &str = "/ws/secure";

// Wire event names past the handshake.
pub const SIGN_UP: &str = "rsa:signUp";
pub const SIGN_UP_RESULT: &str = "rsa:signUpResult";

// Sign-up payload fields and result statuses.
const EMAIL_FIELD: &str = "email";
const PASSWORD_FIELD: &str = "password";
const STATUS_FIELD: &str = "status";
const STATUS_OK: &str = "OK";
const STATUS_TAKEN: &str = "TAKEN";

const MAX_QUEUE_DEPTH: usize = 32;

// Accounts are keyed by email. Nothing else is retained.
type AccountMap = Arc<DashMap<String, ()>>;

// What the connection loop does after a frame has been handled.
enum PeerStep {
    Reply(Frame),
    ReplyThenClose(Frame),
    Ignore,
    Close,
}

// One connected peer. Every socket gets fresh server key pairs; no key
// material survives the connection.
struct PeerSession {
    keys: LocalKeys,
    client_keys: Option<ForeignKeySet>,
    accounts: AccountMap,
}

impl PeerSession {
    fn new(keys: LocalKeys, accounts: AccountMap) -> Self {
        Self {
            keys,
            client_keys: None,
            accounts,
        }
    }

    fn on_frame(&mut self, frame: &Frame) -> PeerStep {
        match frame.name() {
            GET_SERVER_KEYS => self.server_keys_reply(),
            SET_CLIENT_KEYS => self.install_client_keys(&frame.decoded_data()),
            SIGN_UP => match self.sign_up(&frame.decoded_data()) {
                Ok(reply) => PeerStep::Reply(reply),
                Err(err) => {
                    warn!(error = %err, "sign-up failed, dropping peer");
                    PeerStep::Close
                }
            },
            name => {
                warn!(event = name, "no handler for event");
                PeerStep::Ignore
            }
        }
    }

    fn server_keys_reply(&self) -> PeerStep {
        let mut data = Map::new();
        data.insert(
            ENCRYPT_KEY_FIELD.to_string(),
            Value::String(self.keys.encryption_pem().as_str().to_string()),
        );
        data.insert(
            VERIFY_KEY_FIELD.to_string(),
            Value::String(self.keys.signing_pem().as_str().to_string()),
        );
        PeerStep::Reply(Frame::new(SERVER_KEYS, Value::Object(data)))
    }

    // A bad key set gets the rejection verdict, then the socket is
    // closed. There is no second attempt.
    fn install_client_keys(&mut self, payload: &Value) -> PeerStep {
        match self.try_install(payload) {
            Ok(()) => PeerStep::Reply(Frame::new(
                ACCEPT_CLIENT_KEYS,
                Value::String(ACCEPTANCE.to_string()),
            )),
            Err(err) => {
                warn!(error = %err, "rejecting client keys");
                PeerStep::ReplyThenClose(Frame::new(
                    ACCEPT_CLIENT_KEYS,
                    Value::String(REJECTION.to_string()),
                ))
            }
        }
    }

    fn try_install(&mut self, payload: &Value) -> Result<(), ProtocolError> {
        if self.client_keys.is_some() {
            return Err(ProtocolError::UnexpectedEvent);
        }
        let fields = payload.as_object().ok_or(ProtocolError::MalformedFrame)?;
        let encrypt_pem = fields
            .get(ENCRYPT_KEY_FIELD)
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MalformedFrame)?;
        let verify_pem = fields
            .get(VERIFY_KEY_FIELD)
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MalformedFrame)?;
        let set = ForeignKeySet::import(encrypt_pem, verify_pem)?;
        if let (Ok(encrypt), Ok(verify)) = (
            set.encrypt_key().fingerprint(),
            set.verify_key().fingerprint(),
        ) {
            debug!(encrypt = %encrypt, verify = %verify, "client keys installed");
        }
        self.client_keys = Some(set);
        Ok(())
    }

    // Opens the sealed sign-up envelope, records the account, answers
    // with a status envelope sealed toward the client.
    fn sign_up(&mut self, payload: &Value) -> Result<Frame, ProtocolError> {
        let client = self
            .client_keys
            .as_ref()
            .ok_or(ProtocolError::UnexpectedEvent)?;
        let sealed = payload.as_object().ok_or(ProtocolError::MalformedFrame)?;
        let fields = open_envelope(&self.keys.encryption, client.verify_key(), sealed)?;
        let email = fields
            .get(EMAIL_FIELD)
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MalformedFrame)?;
        // The password must open too. It is checked, then discarded.
        fields
            .get(PASSWORD_FIELD)
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MalformedFrame)?;

        let status = if self.accounts.insert(email.to_string(), ()).is_some() {
            STATUS_TAKEN
        } else {
            STATUS_OK
        };
        debug!(account = %account_tag(email), status, "sign-up processed");

        let mut result = Map::new();
        result.insert(STATUS_FIELD.to_string(), Value::String(status.to_string()));
        let sealed_result = seal_envelope(client.encrypt_key(), &self.keys.signing, &result)?;
        Ok(Frame::new(SIGN_UP_RESULT, Value::Object(sealed_result)))
    }
}

// Accept loop. Each connection is served independently; only the
// account map is shared between them.
pub async fn run_server(listener: TcpListener) {
    let accounts: AccountMap = Arc::new(DashMap::new());

    while let Ok((stream, peer_addr)) = listener.accept().await {
        let accounts = accounts.clone();
        tokio::spawn(async move {
            debug!(peer = %peer_addr, "accepted connection");
            if let Err(err) = handle_connection(stream, accounts).await {
                debug!(peer = %peer_addr, error = %err, "connection ended");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    accounts: AccountMap,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let callback = |req: &Request, response: Response| {
        if req.uri().path() == SECURE_PATH {
            Ok(response)
        } else {
            warn!(path = %req.uri().path(), "refusing unknown path");
            let mut refusal = ErrorResponse::new(Some("unknown namespace".to_string()));
            *refusal.status_mut() = StatusCode::NOT_FOUND;
            Err(refusal)
        }
    };

    let ws_stream = accept_hdr_async(stream, callback).await?;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Key generation is CPU-bound; keep it off the runtime threads.
    let keys = tokio::task::spawn_blocking(LocalKeys::generate).await??;
    let mut session = PeerSession::new(keys, accounts);

    // Writer task owns the sink.
    let (tx, mut rx) = mpsc::channel::<Message>(MAX_QUEUE_DEPTH);
    tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let is_close = matches!(message, Message::Close(_));
            if ws_tx.send(message).await.is_err() {
                break;
            }
            if is_close {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let frame = match Frame::decode(&text) {
                    Ok(frame) => frame,
                    Err(err) => {
                        warn!(error = %err, "undecodable frame, dropping peer");
                        let _ = tx.send(Message::Close(None)).await;
                        break;
                    }
                };
                match session.on_frame(&frame) {
                    PeerStep::Reply(reply) => {
                        if tx.send(Message::Text(reply.encode()?)).await.is_err() {
                            break;
                        }
                    }
                    PeerStep::ReplyThenClose(reply) => {
                        let _ = tx.send(Message::Text(reply.encode()?)).await;
                        let _ = tx.send(Message::Close(None)).await;
                        break;
                    }
                    PeerStep::Ignore => {}
                    PeerStep::Close => {
                        let _ = tx.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // Ignore Ping, Pong, Binary.
            Err(err) => {
                debug!(error = %err, "socket error");
                break;
            }
        }
    }

    Ok(())
}

// Truncated digest keeps raw account identifiers out of the logs.
fn account_tag(email: &str) -> String {
    let digest = Sha256::digest(email.as_bytes());
    hex::encode(&digest[..8])
}
