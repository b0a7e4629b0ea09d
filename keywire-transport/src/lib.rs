//! Keywire Transport
//!
//! High-level async client for the key exchange protocol.
//!
//! This crate wraps `keywire-core` and provides the session surface:
//! a frame socket over WebSocket, an event dispatcher, and a secure
//! channel that runs the handshake and moves sealed envelopes.
//!
//! # Security Invariants & Hard Failures
//!
//! Keywire follows a "Hard Fail" philosophy: a handshake either
//! completes in full or the session is abandoned.
//!
//! - **One Strike**: Any handshake violation, bad key or rejection
//!   abandons the exchange. There are no retries on a failed session.
//! - **No Partial Channels**: `SecureChannel` only exists in the
//!   `Ready` state; there is no handle that might seal with missing
//!   keys.
//! - **No Duplication**: `SecureChannel` does not implement `Clone`.
//! - **Single Use Sockets**: A socket opens at most once, ever.
//!   Reopening after close is refused.
//! - **Implicit Cleanup**: `Drop` queues a close toward the peer if
//!   the socket is still up.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod config;
pub mod dispatch;
pub mod error;
pub mod session;
pub mod socket;

pub use config::SessionOptions;
pub use error::TransportError;
pub use session::SecureChannel;
pub use socket::FrameSocket;
