//! Shared-key room payload encryption.
//!
//! Room payloads use ChaCha20-Poly1305 with a 32-byte room key and a
//! 12-byte nonce. Ciphertext and nonce are exported as base64 strings so
//! they can be embedded in JSON event content.

use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use thiserror::Error;

const BASE64: base64::engine::GeneralPurpose = base64::engine::general_purpose::STANDARD;

/// Nonce size for ChaCha20-Poly1305 (96 bits).
pub const ROOM_NONCE_SIZE: usize = 12;
/// Room key size for ChaCha20-Poly1305 (256 bits).
pub const ROOM_KEY_SIZE: usize = 32;

/// Errors returned by room crypto helpers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RoomCryptoError {
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    #[error("invalid nonce length: expected {expected}, got {actual}")]
    InvalidNonceLength { expected: usize, actual: usize },
    #[error("base64 decode failed: {0}")]
    Base64Decode(String),
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// A symmetric room key plus the identifier peers use to look it up.
#[derive(Clone, PartialEq, Eq)]
pub struct RoomKey {
    key_id: String,
    bytes: [u8; ROOM_KEY_SIZE],
}

impl RoomKey {
    /// Generate a fresh random key.
    pub fn generate(key_id: impl Into<String>) -> Self {
        let mut bytes = [0u8; ROOM_KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self {
            key_id: key_id.into(),
            bytes,
        }
    }

    /// Build a key from raw bytes.
    pub fn from_bytes(key_id: impl Into<String>, bytes: &[u8]) -> Result<Self, RoomCryptoError> {
        let bytes: [u8; ROOM_KEY_SIZE] =
            bytes
                .try_into()
                .map_err(|_| RoomCryptoError::InvalidKeyLength {
                    expected: ROOM_KEY_SIZE,
                    actual: bytes.len(),
                })?;
        Ok(Self {
            key_id: key_id.into(),
            bytes,
        })
    }

    /// Build a key from its base64 export.
    pub fn from_base64(key_id: impl Into<String>, encoded: &str) -> Result<Self, RoomCryptoError> {
        let raw = BASE64
            .decode(encoded)
            .map_err(|e| RoomCryptoError::Base64Decode(e.to_string()))?;
        Self::from_bytes(key_id, &raw)
    }

    /// Base64 export of the key bytes.
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.bytes)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

impl std::fmt::Debug for RoomKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomKey")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

/// Base64-encoded encrypted room payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedRoomPayload {
    /// Base64-encoded ciphertext bytes.
    pub ciphertext_b64: String,
    /// Base64-encoded nonce bytes.
    pub nonce_b64: String,
}

/// Encrypts a room payload with a fresh random nonce.
pub fn encrypt_room_payload(
    key: &RoomKey,
    plaintext: &[u8],
) -> Result<EncryptedRoomPayload, RoomCryptoError> {
    let mut nonce = [0u8; ROOM_NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);
    encrypt_room_payload_with_nonce(key, &nonce, plaintext)
}

/// Encrypts a room payload with a caller-provided nonce.
///
/// Only deterministic tests should pick the nonce.
pub fn encrypt_room_payload_with_nonce(
    key: &RoomKey,
    nonce: &[u8; ROOM_NONCE_SIZE],
    plaintext: &[u8],
) -> Result<EncryptedRoomPayload, RoomCryptoError> {
    let cipher = ChaCha20Poly1305::new_from_slice(&key.bytes)
        .map_err(|e| RoomCryptoError::Encrypt(e.to_string()))?;

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|e| RoomCryptoError::Encrypt(e.to_string()))?;

    Ok(EncryptedRoomPayload {
        ciphertext_b64: BASE64.encode(ciphertext),
        nonce_b64: BASE64.encode(nonce),
    })
}

/// Decrypts a base64-encoded room payload.
pub fn decrypt_room_payload(
    key: &RoomKey,
    ciphertext_b64: &str,
    nonce_b64: &str,
) -> Result<Vec<u8>, RoomCryptoError> {
    let ciphertext = BASE64
        .decode(ciphertext_b64)
        .map_err(|e| RoomCryptoError::Base64Decode(e.to_string()))?;
    let nonce = BASE64
        .decode(nonce_b64)
        .map_err(|e| RoomCryptoError::Base64Decode(e.to_string()))?;

    if nonce.len() != ROOM_NONCE_SIZE {
        return Err(RoomCryptoError::InvalidNonceLength {
            expected: ROOM_NONCE_SIZE,
            actual: nonce.len(),
        });
    }

    let cipher = ChaCha20Poly1305::new_from_slice(&key.bytes)
        .map_err(|e| RoomCryptoError::Decrypt(e.to_string()))?;

    cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
        .map_err(|e| RoomCryptoError::Decrypt(e.to_string()))
}
