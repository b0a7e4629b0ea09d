//! Keywire Protocol Core
//!
//! Protocol logic for mutual RSA public key exchange over a framed
//! text transport, and for the sealed field envelopes that follow it.
//!
//! This crate provides:
//! - JSON wire framing with per-message correlation ids
//! - RSA key pair generation, SPKI PEM export and import
//! - Sealed envelopes: OAEP-encrypted values with PSS-signed ciphertexts
//! - Handshake state machine with hard failure semantics
//!
//! # Security Invariants & Defense-in-Depth
//!
//! - Every party uses split key pairs: one for encryption, one for
//!   signatures, never interchangeable
//! - Signatures cover ciphertext, so verification precedes decryption
//! - Any handshake violation fails the exchange; failed exchanges are
//!   never resumed and never keep partial peer key material
//! - Direct use of `unsafe` is forbidden (#![forbid(unsafe_code)])
//! - Best-effort zeroization of plaintext buffers; private keys zeroize
//!   on drop
//! - No retries, no recovery, no partial processing

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::panic))]

pub mod envelope;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod keys;

pub use error::ProtocolError;
pub use frame::Frame;
pub use handshake::{HandshakeMachine, HandshakeState};
pub use keys::{ForeignKey, ForeignKeySet, KeyPurpose, LocalKeyPair, LocalKeys, PublicKeyPem};
