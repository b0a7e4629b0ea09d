//! WebSocket frame socket.
//!
//! One socket serves one session on one namespace. Sockets are single
//! use: after a close (ours or the peer's) the instance is spent, and
//! a new session means a new socket.
//!
//! Two tasks run per connection. A writer task owns the sink half and
//! drains an outbound channel, so any number of callers can send
//! without sharing the sink. A reader task owns the stream half,
//! decodes inbound text into frames and hands them to the dispatcher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use keywire_core::Frame;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::config::{SessionOptions, NAMESPACE_SECURE};
use crate::dispatch::{self, Dispatcher, RawEvent};
use crate::error::TransportError;

type SharedDispatcher = Arc<Mutex<Dispatcher>>;
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Explicit connection state instead of a nullable handle.
enum SocketState {
    Disconnected,
    Connected(ConnectedSocket),
}

struct ConnectedSocket {
    out_tx: mpsc::UnboundedSender<Message>,
    /// Cleared by the reader task when the connection dies, so sends
    /// fail fast instead of queueing into the void.
    alive: Arc<AtomicBool>,
}

/// A frame-oriented socket session.
pub struct FrameSocket {
    options: SessionOptions,
    dispatcher: SharedDispatcher,
    state: SocketState,
    opened: bool,
}

impl FrameSocket {
    /// A closed socket holding its options and a fresh dispatcher.
    ///
    /// Handlers may be registered before or after [`open`].
    ///
    /// [`open`]: FrameSocket::open
    pub fn new(options: SessionOptions) -> Self {
        Self {
            options,
            dispatcher: Arc::new(Mutex::new(Dispatcher::new())),
            state: SocketState::Disconnected,
            opened: false,
        }
    }

    /// Session options this socket was built with.
    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    /// Register (or replace) an event handler.
    ///
    /// Registering from inside a running handler is allowed; the
    /// dispatcher lock is never held while a handler runs.
    pub fn on<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Value, &SessionOptions, &RawEvent) + Send + Sync + 'static,
    {
        self.lock_dispatcher().on(name, handler);
    }

    /// Drop every handler and reinstall the lifecycle defaults.
    pub fn reset_handlers(&self) {
        self.lock_dispatcher().reset();
    }

    /// True while the connection is up.
    pub fn is_connected(&self) -> bool {
        matches!(&self.state, SocketState::Connected(conn) if conn.alive.load(Ordering::SeqCst))
    }

    /// Connect and start the reader and writer tasks.
    ///
    /// Dispatches [`dispatch::CONNECT`] once the connection is up.
    ///
    /// # Errors
    ///
    /// - [`TransportError::AlreadyOpen`] if this socket ever opened
    ///   before, including after a close
    /// - [`TransportError::UnknownNamespace`] for any namespace other
    ///   than [`NAMESPACE_SECURE`]
    /// - [`TransportError::ConnectionFailed`] if the WebSocket
    ///   connection cannot be established
    pub async fn open(&mut self) -> Result<(), TransportError> {
        if self.opened {
            return Err(TransportError::AlreadyOpen);
        }
        if self.options.namespace != NAMESPACE_SECURE {
            return Err(TransportError::UnknownNamespace(self.options.namespace.clone()));
        }

        let url = self.options.endpoint_url();
        debug!(%url, "connecting");
        let (ws, _response) = connect_async(&url)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        self.opened = true;

        let (mut sink, stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let alive = Arc::new(AtomicBool::new(true));

        // Writer task owns the sink; all outbound traffic funnels
        // through the channel.
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let is_close = matches!(message, Message::Close(_));
                if sink.send(message).await.is_err() {
                    break;
                }
                if is_close {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        dispatch_event(
            &self.dispatcher,
            &self.options,
            dispatch::CONNECT,
            &Value::Null,
            &RawEvent::Open,
        );

        let dispatcher = self.dispatcher.clone();
        let options = self.options.clone();
        let reader_alive = alive.clone();
        tokio::spawn(read_loop(stream, dispatcher, options, reader_alive));

        self.state = SocketState::Connected(ConnectedSocket { out_tx, alive });
        Ok(())
    }

    /// Send an event with a fresh correlation id. Returns the id.
    ///
    /// # Errors
    ///
    /// [`TransportError::NotConnected`] without a live connection;
    /// encode failures per [`Frame::encode`].
    pub fn send(&self, name: &str, data: Value) -> Result<String, TransportError> {
        self.send_frame(Frame::new(name, data))
    }

    /// Send an already built frame. Returns its correlation id.
    ///
    /// # Errors
    ///
    /// As for [`send`](FrameSocket::send).
    pub fn send_frame(&self, frame: Frame) -> Result<String, TransportError> {
        let conn = self.connected()?;
        let text = frame.encode()?;
        let req_id = frame.req_id().to_string();
        conn.out_tx
            .send(Message::Text(text))
            .map_err(|_| TransportError::NotConnected)?;
        Ok(req_id)
    }

    /// Close the connection.
    ///
    /// Queues a close frame toward the peer and marks the socket
    /// disconnected; pending sends after this fail with
    /// [`TransportError::NotConnected`]. With `remove_handlers`, the
    /// dispatcher is reset to its defaults.
    ///
    /// # Errors
    ///
    /// [`TransportError::NotConnected`] if the socket never opened or
    /// was already closed.
    pub fn close(
        &mut self,
        remove_handlers: bool,
        code: Option<u16>,
        reason: &str,
    ) -> Result<(), TransportError> {
        let conn = match std::mem::replace(&mut self.state, SocketState::Disconnected) {
            SocketState::Connected(conn) => conn,
            SocketState::Disconnected => return Err(TransportError::NotConnected),
        };
        let close_frame = CloseFrame {
            code: CloseCode::from(code.unwrap_or(1000)),
            reason: reason.to_string().into(),
        };
        // Best effort: the connection may already be gone.
        let _ = conn.out_tx.send(Message::Close(Some(close_frame)));
        if remove_handlers {
            self.reset_handlers();
        }
        debug!("socket closed");
        Ok(())
    }

    fn connected(&self) -> Result<&ConnectedSocket, TransportError> {
        match &self.state {
            SocketState::Connected(conn) if conn.alive.load(Ordering::SeqCst) => Ok(conn),
            _ => Err(TransportError::NotConnected),
        }
    }

    fn lock_dispatcher(&self) -> MutexGuard<'_, Dispatcher> {
        self.dispatcher.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for FrameSocket {
    fn drop(&mut self) {
        if let SocketState::Connected(conn) = &self.state {
            // The writer task closes the stream after relaying this.
            let _ = conn.out_tx.send(Message::Close(None));
        }
    }
}

/// Dispatch one event. The handler is looked up under the lock and
/// invoked after the guard drops, so a handler may register or reset
/// handlers without deadlocking; the read loop's future also stays
/// `Send` this way.
fn dispatch_event(
    dispatcher: &SharedDispatcher,
    options: &SessionOptions,
    name: &str,
    payload: &Value,
    raw: &RawEvent,
) {
    let handler = dispatcher
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .handler_for(name);
    match handler {
        Some(handler) => handler(payload, options, raw),
        None => warn!(event = name, "no handler registered for event"),
    }
}

async fn read_loop(
    mut stream: SplitStream<WsStream>,
    dispatcher: SharedDispatcher,
    options: SessionOptions,
    alive: Arc<AtomicBool>,
) {
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match Frame::decode(&text) {
                Ok(frame) => {
                    let payload = frame.decoded_data();
                    let raw = RawEvent::Frame {
                        frame: frame.clone(),
                        text,
                    };
                    dispatch_event(&dispatcher, &options, frame.name(), &payload, &raw);
                }
                Err(e) => {
                    // Undecodable text is reported, not fatal.
                    let raw = RawEvent::Error(e.to_string());
                    dispatch_event(&dispatcher, &options, dispatch::ERROR, &Value::Null, &raw);
                }
            },
            Some(Ok(Message::Close(close_frame))) => {
                alive.store(false, Ordering::SeqCst);
                let (code, reason) = match close_frame {
                    Some(cf) => (Some(u16::from(cf.code)), cf.reason.to_string()),
                    None => (None, String::new()),
                };
                let raw = RawEvent::Close {
                    clean: true,
                    code,
                    reason,
                };
                dispatch_event(&dispatcher, &options, dispatch::CLOSE, &Value::Null, &raw);
                break;
            }
            Some(Ok(_)) => continue, // Ignore Ping, Pong, Binary
            Some(Err(e)) => {
                alive.store(false, Ordering::SeqCst);
                dispatch_event(
                    &dispatcher,
                    &options,
                    dispatch::ERROR,
                    &Value::Null,
                    &RawEvent::Error(e.to_string()),
                );
                let raw = RawEvent::Close {
                    clean: false,
                    code: None,
                    reason: String::new(),
                };
                dispatch_event(&dispatcher, &options, dispatch::CLOSE, &Value::Null, &raw);
                break;
            }
            None => {
                alive.store(false, Ordering::SeqCst);
                let raw = RawEvent::Close {
                    clean: false,
                    code: None,
                    reason: String::new(),
                };
                dispatch_event(&dispatcher, &options, dispatch::CLOSE, &Value::Null, &raw);
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
}
