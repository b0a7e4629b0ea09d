use std::net::SocketAddr;
use std::sync::OnceLock;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use keywire_core::envelope::{open_envelope, seal_envelope};
use keywire_core::handshake::{ACCEPT_CLIENT_KEYS, REJECTION, SERVER_KEYS, SET_CLIENT_KEYS};
use keywire_core::{Frame, HandshakeMachine, LocalKeys};
use keywire_server::{run_server, SECURE_PATH, SIGN_UP, SIGN_UP_RESULT};

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[tokio::test]
async fn test_full_handshake_and_sign_up() {
    let addr = start_server().await;
    let mut ws = connect(&addr).await;

    let machine = complete_handshake(&mut ws).await;
    let server = machine.foreign_keys().unwrap();
    let local = machine.local_keys().unwrap();

    // 1. Seal the sign-up. Every field doubles into value + signature.
    let mut fields = Map::new();
    fields.insert(
        "email".to_string(),
        Value::String("user@example.com".to_string()),
    );
    fields.insert("password".to_string(), Value::String("hunter2".to_string()));
    let sealed = seal_envelope(server.encrypt_key(), &local.signing, &fields).unwrap();
    assert_eq!(
        sealed.keys().map(String::as_str).collect::<Vec<_>>(),
        vec!["email", "emailSign", "password", "passwordSign"]
    );

    // 2. Send it and open the sealed status reply.
    send_frame(&mut ws, &Frame::new(SIGN_UP, Value::Object(sealed))).await;
    let reply = recv_frame(&mut ws).await;
    assert_eq!(reply.name(), SIGN_UP_RESULT);

    let sealed_reply = reply.decoded_data();
    let opened = open_envelope(
        &local.encryption,
        server.verify_key(),
        sealed_reply.as_object().unwrap(),
    )
    .unwrap();
    assert_eq!(opened.get("status").and_then(Value::as_str), Some("OK"));
}

#[tokio::test]
async fn test_duplicate_email_reports_taken() {
    let addr = start_server().await;

    let mut first = connect(&addr).await;
    let first_machine = complete_handshake(&mut first).await;
    let status = sign_up(&mut first, &first_machine, "taken@example.com").await;
    assert_eq!(status, "OK");

    // A second connection gets fresh server keys but the same accounts.
    let mut second = connect(&addr).await;
    let second_machine = complete_handshake(&mut second).await;
    let status = sign_up(&mut second, &second_machine, "taken@example.com").await;
    assert_eq!(status, "TAKEN");
}

#[tokio::test]
async fn test_unknown_path_refused() {
    let addr = start_server().await;
    let url = format!("ws://{}/ws/chat", addr);

    let err = connect_async(&url).await.err().expect("connect must fail");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(response) => {
            assert_eq!(response.status(), 404);
        }
        other => panic!("expected an http refusal, got {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_client_keys_rejected() {
    let addr = start_server().await;
    let mut ws = connect(&addr).await;

    let bad = json!({ "encryptKey": "not a pem", "verifyKey": "also not" });
    send_frame(&mut ws, &Frame::new(SET_CLIENT_KEYS, bad)).await;

    let verdict = recv_frame(&mut ws).await;
    assert_eq!(verdict.name(), ACCEPT_CLIENT_KEYS);
    assert_eq!(verdict.decoded_data(), Value::String(REJECTION.to_string()));

    expect_close(&mut ws).await;
}

#[tokio::test]
async fn test_sign_up_before_keys_closes() {
    let addr = start_server().await;
    let mut ws = connect(&addr).await;

    let premature = json!({ "email": "a", "emailSign": "b" });
    send_frame(&mut ws, &Frame::new(SIGN_UP, premature)).await;

    expect_close(&mut ws).await;
}

fn test_keys() -> &'static LocalKeys {
    static KEYS: OnceLock<LocalKeys> = OnceLock::new();
    KEYS.get_or_init(|| LocalKeys::generate().expect("key generation"))
}

async fn start_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        run_server(listener).await;
    });
    addr
}

async fn connect(addr: &SocketAddr) -> WsClient {
    let url = format!("ws://{}{}", addr, SECURE_PATH);
    let (ws, _) = connect_async(&url).await.expect("connect failed");
    ws
}

async fn send_frame(ws: &mut WsClient, frame: &Frame) {
    ws.send(Message::Text(frame.encode().unwrap())).await.unwrap();
}

async fn recv_frame(ws: &mut WsClient) -> Frame {
    match timeout(Duration::from_secs(10), ws.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => Frame::decode(&text).unwrap(),
        other => panic!("expected a text frame, got {:?}", other),
    }
}

async fn expect_close(ws: &mut WsClient) {
    match timeout(Duration::from_secs(5), ws.next()).await {
        Ok(Some(Ok(Message::Close(_)))) | Ok(None) => {}
        other => panic!("expected the server to close, got {:?}", other),
    }
}

async fn complete_handshake(ws: &mut WsClient) -> HandshakeMachine {
    let mut machine = HandshakeMachine::new();
    machine.on_keys_generated(test_keys().clone()).unwrap();

    send_frame(ws, &machine.on_connect().unwrap()).await;

    let server_keys = recv_frame(ws).await;
    assert_eq!(server_keys.name(), SERVER_KEYS);
    machine.on_server_keys(&server_keys.decoded_data()).unwrap();

    let client_keys = machine.client_keys_frame().unwrap();
    send_frame(ws, &client_keys).await;
    machine.on_client_keys_sent().unwrap();

    let verdict = recv_frame(ws).await;
    assert_eq!(verdict.name(), ACCEPT_CLIENT_KEYS);
    machine.on_accept_client_keys(&verdict.decoded_data()).unwrap();
    assert!(machine.is_ready());
    machine
}

async fn sign_up(ws: &mut WsClient, machine: &HandshakeMachine, email: &str) -> String {
    let server = machine.foreign_keys().expect("foreign keys");
    let local = machine.local_keys().expect("local keys");

    let mut fields = Map::new();
    fields.insert("email".to_string(), Value::String(email.to_string()));
    fields.insert("password".to_string(), Value::String("hunter2".to_string()));
    let sealed = seal_envelope(server.encrypt_key(), &local.signing, &fields).unwrap();

    send_frame(ws, &Frame::new(SIGN_UP, Value::Object(sealed))).await;

    let reply = recv_frame(ws).await;
    assert_eq!(reply.name(), SIGN_UP_RESULT);

    let sealed_reply = reply.decoded_data();
    let opened = open_envelope(
        &local.encryption,
        server.verify_key(),
        sealed_reply.as_object().unwrap(),
    )
    .unwrap();
    opened
        .get("status")
        .and_then(Value::as_str)
        .expect("status field")
        .to_string()
}
