//! RSA key material.
//!
//! Every party in the exchange holds two distinct 2048-bit key pairs:
//!
//! - an encrypt/decrypt pair, used by the peer to seal values toward us
//!   with RSA-OAEP(SHA-256)
//! - a sign/verify pair, used by us to sign ciphertexts with
//!   RSA-PSS(SHA-256)
//!
//! Public halves travel as SPKI PEM text (`BEGIN PUBLIC KEY` blocks with
//! base64 bodies wrapped at 64 columns). Private halves never leave the
//! process and are zeroized on drop by the underlying provider.

use std::fmt;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::error::ProtocolError;

/// Modulus size for every generated key pair.
pub const KEY_BITS: usize = 2048;

const PEM_HEADER: &str = "-----BEGIN PUBLIC KEY-----";
const PEM_FOOTER: &str = "-----END PUBLIC KEY-----";

/// What a key pair is allowed to be used for.
///
/// Purposes are checked at every seal and open call. Using an encryption
/// key to sign (or the reverse) is a caller bug and is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPurpose {
    /// OAEP encryption toward the holder; decryption by the holder.
    EncryptDecrypt,
    /// PSS signing by the holder; verification by the peer.
    SignVerify,
}

/// An exported public key in SPKI PEM text form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKeyPem(String);

impl PublicKeyPem {
    /// The PEM text, delimiters included.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PublicKeyPem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A locally generated key pair. Holds the private half.
#[derive(Clone)]
pub struct LocalKeyPair {
    purpose: KeyPurpose,
    private: RsaPrivateKey,
    public: RsaPublicKey,
}

// No derived Debug: it would print private key integers.
impl fmt::Debug for LocalKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalKeyPair")
            .field("purpose", &self.purpose)
            .finish_non_exhaustive()
    }
}

impl LocalKeyPair {
    /// Generate a fresh 2048-bit pair for the given purpose.
    ///
    /// This is CPU-bound and can take on the order of a second. Async
    /// callers should run it on a blocking thread.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::CryptoProvider`] if the provider fails to
    /// produce a key.
    pub fn generate(purpose: KeyPurpose) -> Result<Self, ProtocolError> {
        let mut rng = OsRng;
        let private = RsaPrivateKey::new(&mut rng, KEY_BITS)
            .map_err(|_| ProtocolError::CryptoProvider)?;
        let public = RsaPublicKey::from(&private);
        Ok(Self {
            purpose,
            private,
            public,
        })
    }

    /// The purpose this pair was generated for.
    pub fn purpose(&self) -> KeyPurpose {
        self.purpose
    }

    /// Export the public half as SPKI PEM.
    ///
    /// Export is deterministic: the same pair always yields the same
    /// text, so it can be re-sent or compared byte for byte.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::CryptoProvider`] if DER encoding fails.
    pub fn export_public_pem(&self) -> Result<PublicKeyPem, ProtocolError> {
        let pem = self
            .public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|_| ProtocolError::CryptoProvider)?;
        Ok(PublicKeyPem(pem))
    }

    /// Short identifier for logs: first 8 bytes of SHA-256 over the
    /// SPKI DER encoding, hex encoded (16 chars).
    ///
    /// # Errors
    ///
    /// [`ProtocolError::CryptoProvider`] if DER encoding fails.
    pub fn fingerprint(&self) -> Result<String, ProtocolError> {
        fingerprint_spki(&self.public)
    }

    pub(crate) fn private_key(&self) -> &RsaPrivateKey {
        &self.private
    }
}

/// A peer's imported public key.
#[derive(Debug, Clone)]
pub struct ForeignKey {
    purpose: KeyPurpose,
    key: RsaPublicKey,
    pem: PublicKeyPem,
}

impl ForeignKey {
    /// Import a peer public key from SPKI PEM text.
    ///
    /// # Errors
    ///
    /// - [`ProtocolError::MalformedKey`] if the delimiters are missing
    ///   or the body is not base64
    /// - [`ProtocolError::CryptoProvider`] if the decoded DER is not an
    ///   RSA public key
    pub fn import_public_pem(pem: &str, purpose: KeyPurpose) -> Result<Self, ProtocolError> {
        let der = decode_pem_body(pem)?;
        let key = RsaPublicKey::from_public_key_der(&der)
            .map_err(|_| ProtocolError::CryptoProvider)?;
        Ok(Self {
            purpose,
            key,
            pem: PublicKeyPem(pem.to_owned()),
        })
    }

    /// The purpose this key was imported for.
    pub fn purpose(&self) -> KeyPurpose {
        self.purpose
    }

    /// The original PEM text this key was imported from.
    pub fn pem(&self) -> &PublicKeyPem {
        &self.pem
    }

    /// Short identifier for logs. Matches the exporter's fingerprint
    /// for the same key bytes.
    ///
    /// # Errors
    ///
    /// [`ProtocolError::CryptoProvider`] if DER encoding fails.
    pub fn fingerprint(&self) -> Result<String, ProtocolError> {
        fingerprint_spki(&self.key)
    }

    pub(crate) fn public_key(&self) -> &RsaPublicKey {
        &self.key
    }
}

/// Both peer keys, imported together.
///
/// Construction is all-or-nothing: if either PEM fails to import, no
/// set exists and no partial key material is retained.
#[derive(Debug, Clone)]
pub struct ForeignKeySet {
    encrypt: ForeignKey,
    verify: ForeignKey,
}

impl ForeignKeySet {
    /// Import the peer's encryption key and verification key.
    ///
    /// # Errors
    ///
    /// Propagates the first import failure; see
    /// [`ForeignKey::import_public_pem`].
    pub fn import(encrypt_pem: &str, verify_pem: &str) -> Result<Self, ProtocolError> {
        let encrypt = ForeignKey::import_public_pem(encrypt_pem, KeyPurpose::EncryptDecrypt)?;
        let verify = ForeignKey::import_public_pem(verify_pem, KeyPurpose::SignVerify)?;
        Ok(Self { encrypt, verify })
    }

    /// Key used to seal values toward the peer.
    pub fn encrypt_key(&self) -> &ForeignKey {
        &self.encrypt
    }

    /// Key used to verify the peer's ciphertext signatures.
    pub fn verify_key(&self) -> &ForeignKey {
        &self.verify
    }
}

/// The two local pairs a party brings to an exchange, plus their
/// exported public halves.
#[derive(Debug, Clone)]
pub struct LocalKeys {
    /// Pair the peer encrypts toward; we decrypt.
    pub encryption: LocalKeyPair,
    /// Pair we sign with; the peer verifies.
    pub signing: LocalKeyPair,
    encryption_pem: PublicKeyPem,
    signing_pem: PublicKeyPem,
}

impl LocalKeys {
    /// Generate both pairs and export their public halves.
    ///
    /// Runs two full key generations; see [`LocalKeyPair::generate`]
    /// for the blocking caveat.
    ///
    /// # Errors
    ///
    /// Propagates generation or export failure.
    pub fn generate() -> Result<Self, ProtocolError> {
        let encryption = LocalKeyPair::generate(KeyPurpose::EncryptDecrypt)?;
        let signing = LocalKeyPair::generate(KeyPurpose::SignVerify)?;
        let encryption_pem = encryption.export_public_pem()?;
        let signing_pem = signing.export_public_pem()?;
        Ok(Self {
            encryption,
            signing,
            encryption_pem,
            signing_pem,
        })
    }

    /// Exported public half of the encryption pair.
    pub fn encryption_pem(&self) -> &PublicKeyPem {
        &self.encryption_pem
    }

    /// Exported public half of the signing pair.
    pub fn signing_pem(&self) -> &PublicKeyPem {
        &self.signing_pem
    }
}

fn fingerprint_spki(key: &RsaPublicKey) -> Result<String, ProtocolError> {
    let der = key
        .to_public_key_der()
        .map_err(|_| ProtocolError::CryptoProvider)?;
    let digest = Sha256::digest(der.as_bytes());
    Ok(hex::encode(&digest[..8]))
}

/// Strip PEM delimiters and decode the base64 body.
fn decode_pem_body(pem: &str) -> Result<Vec<u8>, ProtocolError> {
    let start = pem.find(PEM_HEADER).ok_or(ProtocolError::MalformedKey)?;
    let end = pem.find(PEM_FOOTER).ok_or(ProtocolError::MalformedKey)?;
    let body_start = start + PEM_HEADER.len();
    // Bounds check: footer must follow the header
    if end < body_start {
        return Err(ProtocolError::MalformedKey);
    }
    let body: String = pem[body_start..end].split_whitespace().collect();
    if body.is_empty() {
        return Err(ProtocolError::MalformedKey);
    }
    BASE64
        .decode(body.as_bytes())
        .map_err(|_| ProtocolError::MalformedKey)
}

#[cfg(test)]
mod tests {
    use std::sync::OnceLock;

    use rsa::{Oaep, Pss};

    use super::*;

    // Key generation is expensive; share one set across tests.
    fn test_pair() -> &'static LocalKeyPair {
        static PAIR: OnceLock<LocalKeyPair> = OnceLock::new();
        PAIR.get_or_init(|| {
            LocalKeyPair::generate(KeyPurpose::EncryptDecrypt).expect("keygen")
        })
    }

    #[test]
    fn test_export_is_pem_shaped() {
        let pem = test_pair().export_public_pem().expect("export");
        let text = pem.as_str();
        assert!(text.starts_with(PEM_HEADER));
        assert!(text.trim_end().ends_with(PEM_FOOTER));
        for line in text.lines() {
            if line.starts_with("-----") {
                continue;
            }
            assert!(line.len() <= 64, "body line too wide: {}", line.len());
        }
    }

    #[test]
    fn test_export_is_deterministic() {
        let a = test_pair().export_public_pem().expect("export");
        let b = test_pair().export_public_pem().expect("export");
        assert_eq!(a, b);
    }

    #[test]
    fn test_pem_roundtrip_preserves_key() {
        let pair = test_pair();
        let pem = pair.export_public_pem().expect("export");
        let foreign =
            ForeignKey::import_public_pem(pem.as_str(), KeyPurpose::EncryptDecrypt).expect("import");

        // Encrypt with the re-imported key, decrypt with the original private.
        let mut rng = rand::thread_rng();
        let ciphertext = foreign
            .public_key()
            .encrypt(&mut rng, Oaep::new::<Sha256>(), b"roundtrip")
            .expect("encrypt");
        let plaintext = pair
            .private_key()
            .decrypt(Oaep::new::<Sha256>(), &ciphertext)
            .expect("decrypt");
        assert_eq!(plaintext, b"roundtrip");
    }

    #[test]
    fn test_imported_key_verifies_local_signatures() {
        let pair = LocalKeyPair::generate(KeyPurpose::SignVerify).expect("keygen");
        let pem = pair.export_public_pem().expect("export");
        let foreign =
            ForeignKey::import_public_pem(pem.as_str(), KeyPurpose::SignVerify).expect("import");

        let digest = Sha256::digest(b"signed bytes");
        let mut rng = rand::thread_rng();
        let sig = pair
            .private_key()
            .sign_with_rng(&mut rng, Pss::new_with_salt::<Sha256>(0), &digest)
            .expect("sign");
        foreign
            .public_key()
            .verify(Pss::new_with_salt::<Sha256>(0), &digest, &sig)
            .expect("verify");
    }

    #[test]
    fn test_fingerprint_matches_across_export_import() {
        let pair = test_pair();
        let pem = pair.export_public_pem().expect("export");
        let foreign =
            ForeignKey::import_public_pem(pem.as_str(), KeyPurpose::EncryptDecrypt).expect("import");
        let local_fp = pair.fingerprint().expect("fp");
        assert_eq!(local_fp.len(), 16);
        assert_eq!(local_fp, foreign.fingerprint().expect("fp"));
    }

    #[test]
    fn test_import_rejects_missing_delimiters() {
        let err = ForeignKey::import_public_pem("no delimiters here", KeyPurpose::EncryptDecrypt)
            .expect_err("should fail");
        assert_eq!(err, ProtocolError::MalformedKey);
    }

    #[test]
    fn test_import_rejects_empty_body() {
        let pem = format!("{PEM_HEADER}\n{PEM_FOOTER}\n");
        let err = ForeignKey::import_public_pem(&pem, KeyPurpose::EncryptDecrypt)
            .expect_err("should fail");
        assert_eq!(err, ProtocolError::MalformedKey);
    }

    #[test]
    fn test_import_rejects_non_base64_body() {
        let pem = format!("{PEM_HEADER}\n!!!not base64!!!\n{PEM_FOOTER}\n");
        let err = ForeignKey::import_public_pem(&pem, KeyPurpose::EncryptDecrypt)
            .expect_err("should fail");
        assert_eq!(err, ProtocolError::MalformedKey);
    }

    #[test]
    fn test_import_rejects_garbage_der() {
        // Valid base64, but the decoded bytes are not an SPKI key.
        let body = BASE64.encode(b"these bytes are not a key");
        let pem = format!("{PEM_HEADER}\n{body}\n{PEM_FOOTER}\n");
        let err = ForeignKey::import_public_pem(&pem, KeyPurpose::EncryptDecrypt)
            .expect_err("should fail");
        assert_eq!(err, ProtocolError::CryptoProvider);
    }

    #[test]
    fn test_foreign_set_import_is_all_or_nothing() {
        let good = test_pair().export_public_pem().expect("export");
        let err = ForeignKeySet::import(good.as_str(), "not a key").expect_err("should fail");
        assert_eq!(err, ProtocolError::MalformedKey);
    }
}
