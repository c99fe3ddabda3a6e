//! Hybrid payload decryption
//!
//! A per-message AES-256 key is wrapped with RSA-OAEP (SHA-256 digest,
//! MGF1-SHA256, empty label); the payload is sealed with AES-256-GCM.
//!
//! Wire format (base64 for transport):
//!   [ key len (2 bytes BE) | wrapped key | nonce (12 bytes) | ciphertext + tag (16 bytes) ]

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose, Engine as _};
use rsa::pkcs8::DecodePublicKey;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

pub const LEN_PREFIX: usize = 2;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
pub const AES_KEY_LEN: usize = 32;

/// Diagnostic cause of a failed decryption. Callers treat every kind the
/// same; the kind exists for logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecryptFailure {
    Encoding,
    Truncated,
    KeyUnwrap,
    Authentication,
    Utf8,
}

impl DecryptFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecryptFailure::Encoding => "encoding",
            DecryptFailure::Truncated => "truncated",
            DecryptFailure::KeyUnwrap => "key_unwrap",
            DecryptFailure::Authentication => "authentication",
            DecryptFailure::Utf8 => "utf8",
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("payload could not be decrypted")]
pub struct DecryptError {
    kind: DecryptFailure,
}

impl DecryptError {
    fn new(kind: DecryptFailure) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> DecryptFailure {
        self.kind
    }

    /// The symmetric key did not unwrap, which is what a payload sealed for
    /// a different key pair looks like.
    pub fn is_foreign_key(&self) -> bool {
        self.kind == DecryptFailure::KeyUnwrap
    }
}

#[derive(Debug, Error)]
pub enum EncryptError {
    #[error("key wrap failed: {0}")]
    KeyWrap(String),
    #[error("AEAD encryption failed")]
    Aead,
    #[error("wrapped key too long: {0} bytes")]
    WrappedKeyTooLong(usize),
    #[error("invalid public key: {0}")]
    PublicKey(String),
}

/// Borrowed view of a decoded payload.
#[derive(Debug, PartialEq, Eq)]
pub struct HybridPayload<'a> {
    pub wrapped_key: &'a [u8],
    pub nonce: &'a [u8],
    pub ciphertext: &'a [u8],
}

impl<'a> HybridPayload<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, DecryptError> {
        let truncated = || DecryptError::new(DecryptFailure::Truncated);
        if bytes.len() < LEN_PREFIX {
            return Err(truncated());
        }
        let (prefix, rest) = bytes.split_at(LEN_PREFIX);
        let wrapped_len = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
        if rest.len() < wrapped_len + NONCE_LEN + TAG_LEN {
            return Err(truncated());
        }
        let (wrapped_key, rest) = rest.split_at(wrapped_len);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);
        Ok(Self {
            wrapped_key,
            nonce,
            ciphertext,
        })
    }
}

/// Decrypt a base64 hybrid payload with the device private key.
pub fn decrypt(encoded: &str, key: &RsaPrivateKey) -> Result<String, DecryptError> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = general_purpose::STANDARD
        .decode(compact)
        .map_err(|_| DecryptError::new(DecryptFailure::Encoding))?;
    let payload = HybridPayload::parse(&bytes)?;

    let aes_key = Zeroizing::new(
        key.decrypt(Oaep::new::<Sha256>(), payload.wrapped_key)
            .map_err(|_| DecryptError::new(DecryptFailure::KeyUnwrap))?,
    );
    if aes_key.len() != AES_KEY_LEN {
        return Err(DecryptError::new(DecryptFailure::KeyUnwrap));
    }

    let cipher = Aes256Gcm::new_from_slice(&aes_key)
        .map_err(|_| DecryptError::new(DecryptFailure::KeyUnwrap))?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(payload.nonce), payload.ciphertext)
        .map_err(|_| DecryptError::new(DecryptFailure::Authentication))?;

    String::from_utf8(plaintext).map_err(|_| DecryptError::new(DecryptFailure::Utf8))
}

/// Fail-soft variant: any failure is `None`.
pub fn try_decrypt(encoded: &str, key: &RsaPrivateKey) -> Option<String> {
    decrypt(encoded, key).ok()
}

/// Seal `plaintext` for the holder of `key`, producing the same layout the
/// server emits.
pub fn encrypt(plaintext: &str, key: &RsaPublicKey) -> Result<String, EncryptError> {
    let aes_key = Aes256Gcm::generate_key(OsRng);
    let wrapped = key
        .encrypt(&mut OsRng, Oaep::new::<Sha256>(), aes_key.as_slice())
        .map_err(|e| EncryptError::KeyWrap(e.to_string()))?;
    let wrapped_len =
        u16::try_from(wrapped.len()).map_err(|_| EncryptError::WrappedKeyTooLong(wrapped.len()))?;

    let cipher = Aes256Gcm::new(&aes_key);
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext.as_bytes())
        .map_err(|_| EncryptError::Aead)?;

    let mut out = Vec::with_capacity(LEN_PREFIX + wrapped.len() + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&wrapped_len.to_be_bytes());
    out.extend_from_slice(&wrapped);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(general_purpose::STANDARD.encode(out))
}

/// [`encrypt`] for a PEM-encoded (SPKI) public key.
pub fn encrypt_for_pem(plaintext: &str, public_key_pem: &str) -> Result<String, EncryptError> {
    let key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| EncryptError::PublicKey(e.to_string()))?;
    encrypt(plaintext, &key)
}
