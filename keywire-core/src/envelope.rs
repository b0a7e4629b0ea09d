//! Sealed field envelopes.
//!
//! A sealed field is the JSON encoding of a value, encrypted toward the
//! peer with RSA-OAEP(SHA-256), plus an RSA-PSS(SHA-256, zero salt)
//! signature computed over the SHA-256 digest of the *ciphertext*.
//! Signing the ciphertext instead of the plaintext means verification
//! runs before any decryption and never touches attacker-controlled
//! plaintext.
//!
//! On the wire a sealed envelope doubles every field:
//!
//! ```text
//! { "email": base64(ciphertext), "emailSign": base64(signature), ... }
//! ```
//!
//! JSON encoding is canonical for a given value: object keys serialize
//! in sorted order, so both sides produce identical plaintext bytes for
//! identical values.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::ProtocolError;
use crate::keys::{ForeignKey, KeyPurpose, LocalKeyPair};

/// Appended to a field name to form its signature slot.
pub const SIGNATURE_SUFFIX: &str = "Sign";

/// Largest JSON-encoded value a single field can carry.
///
/// Fixed by the primitives: a 2048-bit modulus minus OAEP(SHA-256)
/// overhead leaves 190 bytes of plaintext.
pub const MAX_FIELD_PLAINTEXT: usize = 190;

/// Output of sealing one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedField {
    /// base64 of the OAEP ciphertext.
    pub ciphertext: String,
    /// base64 of the PSS signature over the ciphertext digest.
    pub signature: String,
}

/// Seal a single value toward the peer.
///
/// # Errors
///
/// - [`ProtocolError::CryptoProvider`] if a key of the wrong purpose is
///   passed
/// - [`ProtocolError::Encryption`] if the encoded value exceeds
///   [`MAX_FIELD_PLAINTEXT`] or a primitive fails
pub fn seal_field(
    encrypt_with: &ForeignKey,
    sign_with: &LocalKeyPair,
    value: &Value,
) -> Result<SealedField, ProtocolError> {
    check_purposes(encrypt_with, sign_with)?;

    let plaintext = Zeroizing::new(
        serde_json::to_vec(value).map_err(|_| ProtocolError::Encryption)?,
    );
    if plaintext.len() > MAX_FIELD_PLAINTEXT {
        return Err(ProtocolError::Encryption);
    }

    let mut rng = rand::thread_rng();
    let ciphertext = encrypt_with
        .public_key()
        .encrypt(&mut rng, rsa::Oaep::new::<Sha256>(), &plaintext)
        .map_err(|_| ProtocolError::Encryption)?;

    let digest = Sha256::digest(&ciphertext);
    let signature = sign_with
        .private_key()
        .sign_with_rng(&mut rng, rsa::Pss::new_with_salt::<Sha256>(0), &digest)
        .map_err(|_| ProtocolError::Encryption)?;

    Ok(SealedField {
        ciphertext: base64_encode(&ciphertext),
        signature: base64_encode(&signature),
    })
}

/// Open a single sealed field from the peer.
///
/// The signature is verified against the ciphertext digest first; the
/// ciphertext is only decrypted once the signature holds.
///
/// # Errors
///
/// - [`ProtocolError::CryptoProvider`] if a key of the wrong purpose is
///   passed
/// - [`ProtocolError::SignatureInvalid`] if the signature does not
///   verify
/// - [`ProtocolError::Encryption`] if base64 decoding, decryption or
///   JSON decoding fails
pub fn open_field(
    decrypt_with: &LocalKeyPair,
    verify_with: &ForeignKey,
    ciphertext_b64: &str,
    signature_b64: &str,
) -> Result<Value, ProtocolError> {
    check_open_purposes(decrypt_with, verify_with)?;

    let ciphertext = base64_decode(ciphertext_b64)?;
    let signature = base64_decode(signature_b64)?;

    let digest = Sha256::digest(&ciphertext);
    verify_with
        .public_key()
        .verify(rsa::Pss::new_with_salt::<Sha256>(0), &digest, &signature)
        .map_err(|_| ProtocolError::SignatureInvalid)?;

    let plaintext = Zeroizing::new(
        decrypt_with
            .private_key()
            .decrypt(rsa::Oaep::new::<Sha256>(), &ciphertext)
            .map_err(|_| ProtocolError::Encryption)?,
    );
    serde_json::from_slice(&plaintext).map_err(|_| ProtocolError::Encryption)
}

/// Seal every field of a payload.
///
/// Each input field `k` produces two output entries, `k` and
/// `k + "Sign"`. Field names ending in the suffix are rejected; they
/// would collide with a signature slot.
///
/// # Errors
///
/// Propagates [`seal_field`] failures; [`ProtocolError::Encryption`]
/// for a reserved field name.
pub fn seal_envelope(
    encrypt_with: &ForeignKey,
    sign_with: &LocalKeyPair,
    fields: &Map<String, Value>,
) -> Result<Map<String, Value>, ProtocolError> {
    let mut sealed = Map::new();
    for (name, value) in fields {
        if name.ends_with(SIGNATURE_SUFFIX) {
            return Err(ProtocolError::Encryption);
        }
        let field = seal_field(encrypt_with, sign_with, value)?;
        sealed.insert(name.clone(), Value::String(field.ciphertext));
        sealed.insert(
            format!("{name}{SIGNATURE_SUFFIX}"),
            Value::String(field.signature),
        );
    }
    Ok(sealed)
}

/// Open every field of a sealed envelope.
///
/// All fields must open. One bad signature or missing slot fails the
/// whole envelope; no partially opened payload is returned.
///
/// # Errors
///
/// Propagates [`open_field`] failures; [`ProtocolError::Encryption`]
/// if a field is missing its signature slot, a signature slot is
/// missing its field, or a slot is not a string.
pub fn open_envelope(
    decrypt_with: &LocalKeyPair,
    verify_with: &ForeignKey,
    sealed: &Map<String, Value>,
) -> Result<Map<String, Value>, ProtocolError> {
    let mut fields = Map::new();
    for (name, value) in sealed {
        if name.ends_with(SIGNATURE_SUFFIX) {
            // Signature slots must belong to a field in the same envelope.
            let base = &name[..name.len() - SIGNATURE_SUFFIX.len()];
            if base.is_empty() || !sealed.contains_key(base) {
                return Err(ProtocolError::Encryption);
            }
            continue;
        }
        let ciphertext = value.as_str().ok_or(ProtocolError::Encryption)?;
        let signature = sealed
            .get(&format!("{name}{SIGNATURE_SUFFIX}"))
            .and_then(Value::as_str)
            .ok_or(ProtocolError::Encryption)?;
        let opened = open_field(decrypt_with, verify_with, ciphertext, signature)?;
        fields.insert(name.clone(), opened);
    }
    Ok(fields)
}

fn check_purposes(
    encrypt_with: &ForeignKey,
    sign_with: &LocalKeyPair,
) -> Result<(), ProtocolError> {
    if encrypt_with.purpose() != KeyPurpose::EncryptDecrypt
        || sign_with.purpose() != KeyPurpose::SignVerify
    {
        return Err(ProtocolError::CryptoProvider);
    }
    Ok(())
}

fn check_open_purposes(
    decrypt_with: &LocalKeyPair,
    verify_with: &ForeignKey,
) -> Result<(), ProtocolError> {
    if decrypt_with.purpose() != KeyPurpose::EncryptDecrypt
        || verify_with.purpose() != KeyPurpose::SignVerify
    {
        return Err(ProtocolError::CryptoProvider);
    }
    Ok(())
}

fn base64_encode(bytes: &[u8]) -> String {
    BASE64.encode(bytes)
}

fn base64_decode(text: &str) -> Result<Vec<u8>, ProtocolError> {
    BASE64.decode(text).map_err(|_| ProtocolError::Encryption)
}
