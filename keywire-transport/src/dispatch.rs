//! Event dispatch.
//!
//! Inbound traffic is routed by event name through a table of shared
//! handlers. Lifecycle events (`connect`, `error`, `close`) always have
//! a handler: log-only defaults are installed at construction and after
//! every reset, so a session with no registrations still reports what
//! happened to it.

use std::collections::HashMap;
use std::sync::Arc;

use keywire_core::Frame;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::SessionOptions;

/// Lifecycle event: the connection opened.
pub const CONNECT: &str = "connect";
/// Lifecycle event: the transport reported an error.
pub const ERROR: &str = "error";
/// Lifecycle event: the connection closed.
pub const CLOSE: &str = "close";

/// The transport occurrence behind a dispatched event.
#[derive(Debug, Clone)]
pub enum RawEvent {
    /// Connection established.
    Open,
    /// An inbound frame.
    Frame {
        /// Decoded frame.
        frame: Frame,
        /// Wire text the frame was decoded from.
        text: String,
    },
    /// Transport-level error description.
    Error(String),
    /// Connection closed.
    Close {
        /// True when the peer completed the close handshake.
        clean: bool,
        /// Close code, when the peer sent one.
        code: Option<u16>,
        /// Close reason, possibly empty.
        reason: String,
    },
}

/// Shared event handler.
///
/// Handlers receive the tolerantly decoded payload, the session options
/// and the raw event behind the dispatch. They run on the socket's read
/// task and must not block; anything slow belongs on a channel to
/// another task.
///
/// Handlers are reference counted: [`Dispatcher::handler_for`] hands
/// out a clone, so a running handler holds no borrow of the table and
/// may itself register or reset handlers.
pub type Handler = Arc<dyn Fn(&Value, &SessionOptions, &RawEvent) + Send + Sync>;

/// Routes inbound events to handlers by event name.
///
/// One handler per name; registering a name again replaces the
/// previous handler.
pub struct Dispatcher {
    handlers: HashMap<String, Handler>,
}

impl Dispatcher {
    /// A dispatcher with only the default lifecycle handlers.
    pub fn new() -> Self {
        let mut dispatcher = Self {
            handlers: HashMap::new(),
        };
        dispatcher.install_defaults();
        dispatcher
    }

    fn install_defaults(&mut self) {
        self.on(CONNECT, |_payload, options, _raw| {
            debug!(host = %options.host, port = options.port, "connection established");
        });
        self.on(ERROR, |_payload, _options, raw| {
            let detail = match raw {
                RawEvent::Error(detail) => detail.as_str(),
                _ => "unknown",
            };
            warn!(%detail, "transport error");
        });
        self.on(CLOSE, |_payload, _options, raw| match raw {
            RawEvent::Close {
                clean: true,
                code,
                reason,
            } => {
                debug!(?code, %reason, "connection closed cleanly");
            }
            _ => warn!("connection interrupted"),
        });
    }

    /// Register (or replace) the handler for an event name.
    pub fn on<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Value, &SessionOptions, &RawEvent) + Send + Sync + 'static,
    {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    /// Drop every handler and reinstall the defaults.
    pub fn reset(&mut self) {
        self.handlers.clear();
        self.install_defaults();
    }

    /// The handler registered for an event name, if any.
    ///
    /// An event nobody registered for is reported and dropped by the
    /// caller. It never tears the session down; peers are allowed to
    /// speak event names we do not know.
    pub fn handler_for(&self, name: &str) -> Option<Handler> {
        self.handlers.get(name).cloned()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
