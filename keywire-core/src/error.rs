//! Protocol errors.
//!
//! Every variant is terminal for the handshake that raised it. A failed
//! exchange is abandoned, never resumed with partial key material.
//!
//! Messages stay terse. Key bytes, plaintext and peer input never appear
//! in an error.

use thiserror::Error;

/// All possible protocol errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// Public key text is not a parseable SPKI PEM block.
    #[error("malformed public key")]
    MalformedKey,

    /// The crypto provider rejected otherwise well-formed input.
    #[error("crypto provider rejected key material")]
    CryptoProvider,

    /// Sealing or opening a field failed.
    #[error("field encryption failed")]
    Encryption,

    /// A ciphertext signature did not verify against the peer's key.
    #[error("signature verification failed")]
    SignatureInvalid,

    /// The peer refused our public keys during the handshake.
    #[error("peer rejected client keys")]
    HandshakeRejected,

    /// Inbound text was not a decodable frame, or a frame payload was
    /// missing a required field.
    #[error("malformed frame")]
    MalformedFrame,

    /// An event arrived that the current handshake state cannot accept.
    #[error("unexpected event for handshake state")]
    UnexpectedEvent,
}
