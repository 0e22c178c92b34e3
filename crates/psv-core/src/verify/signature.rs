//! ECDSA P-256 manifest signatures.
//!
//! A publisher signs `"<id>:<version>:<checksum>"` with their secret key; the
//! base64 DER signature goes into `manifest.signature`. Publishers are known
//! by base64 SEC1 public keys listed in `verification.trusted_keys`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use p256::ecdsa::{signature::Verifier as _, Signature, SigningKey, VerifyingKey};
use sha2::{Digest, Sha256};

/// Errors from key and signature handling.
#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("no trusted keys configured")]
    NoKeys,
    #[error("invalid public key: {0}")]
    InvalidKey(String),
    #[error("invalid secret key: {0}")]
    InvalidSecretKey(String),
    #[error("invalid signature encoding: {0}")]
    InvalidSignature(String),
    #[error("signature does not match any trusted key (tried {tried})")]
    Untrusted { tried: usize },
}

/// Parse a base64 SEC1 public key (compressed or uncompressed).
pub fn parse_public_key(b64: &str) -> Result<VerifyingKey, SignatureError> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| SignatureError::InvalidKey(format!("base64 decode: {e}")))?;
    VerifyingKey::from_sec1_bytes(&bytes)
        .map_err(|e| SignatureError::InvalidKey(format!("SEC1 decode: {e}")))
}

/// Parse a base64 raw 32-byte secret scalar.
pub fn parse_secret_key(b64: &str) -> Result<SigningKey, SignatureError> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| SignatureError::InvalidSecretKey(format!("base64 decode: {e}")))?;
    SigningKey::from_slice(&bytes).map_err(|e| SignatureError::InvalidSecretKey(e.to_string()))
}

/// Parse a base64 DER signature.
pub fn parse_signature(b64: &str) -> Result<Signature, SignatureError> {
    let bytes = BASE64
        .decode(b64.trim())
        .map_err(|e| SignatureError::InvalidSignature(format!("base64 decode: {e}")))?;
    Signature::from_der(&bytes)
        .map_err(|e| SignatureError::InvalidSignature(format!("DER decode: {e}")))
}

/// Hex SHA-256 of the SEC1 encoding, used to name keys in logs and reports.
pub fn key_fingerprint(key: &VerifyingKey) -> String {
    hex::encode(Sha256::digest(key.to_sec1_bytes()))
}

/// The set of publisher keys a supervisor trusts.
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: Vec<VerifyingKey>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from base64 keys; the first malformed key fails the whole set.
    pub fn from_base64_keys<S: AsRef<str>>(keys: &[S]) -> Result<Self, SignatureError> {
        let keys = keys
            .iter()
            .map(|k| parse_public_key(k.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { keys })
    }

    pub fn add_key(&mut self, key: VerifyingKey) {
        self.keys.push(key);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Check a base64 DER signature over `payload`. Returns the fingerprint
    /// of the first key that validates.
    pub fn verify(&self, payload: &[u8], signature_b64: &str) -> Result<String, SignatureError> {
        if self.keys.is_empty() {
            return Err(SignatureError::NoKeys);
        }
        let signature = parse_signature(signature_b64)?;
        self.keys
            .iter()
            .find(|key| key.verify(payload, &signature).is_ok())
            .map(key_fingerprint)
            .ok_or(SignatureError::Untrusted {
                tried: self.keys.len(),
            })
    }
}

/// Sign `payload`, returning the base64 DER signature.
pub fn sign_payload(payload: &[u8], key: &SigningKey) -> String {
    use p256::ecdsa::signature::Signer;
    let signature: Signature = key.sign(payload);
    BASE64.encode(signature.to_der().as_bytes())
}

/// A fresh key pair as base64 `(secret scalar, SEC1 public key)`.
pub fn generate_keypair() -> (String, String) {
    let secret = SigningKey::random(&mut rand_core::OsRng);
    let public = secret.verifying_key().to_sec1_bytes();
    (BASE64.encode(secret.to_bytes()), BASE64.encode(public))
}
