//! Callback keys: EncodingAESKey handling, generation, and rotation.
//!
//! - Token: an alphanumeric string (default 32 chars; max 32), used for SHA1 signature verification.
//! - EncodingAESKey: a 43-character Base64 string (letters/digits only, no padding) that decodes to 32 bytes
//!   when appending a single '='. It is the AES-256 key for callback payloads; the IV is its first 16 bytes.
//! - [`KeyRing`]: the current key plus the one it replaced, so messages encrypted just before a
//!   rotation still decrypt.

use std::fmt;

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use parking_lot::RwLock;
use rand::RngCore;
use rand::distr::{Alphanumeric, SampleString};
use thiserror::Error;

// Randomly generated 43-char keys may carry non-zero trailing bits in the last symbol.
const KEY_ENGINE: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_allow_trailing_bits(true),
);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("EncodingAESKey must be 43 characters, got {0}")]
    InvalidLength(usize),
    #[error("invalid base64 in EncodingAESKey: {0}")]
    Base64(String),
    #[error("EncodingAESKey must decode to 32 bytes, got {0}")]
    InvalidKeyBytes(usize),
}

/// A 32-byte AES-256 key. The all-zero key means "not set".
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct AesKey([u8; 32]);

impl fmt::Debug for AesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_zero() {
            f.write_str("AesKey(zero)")
        } else {
            f.write_str("AesKey(***)")
        }
    }
}

impl AesKey {
    pub const ZERO: AesKey = AesKey([0u8; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Decode a 43-char EncodingAESKey (base64 without its trailing '=').
    pub fn from_encoding_aes_key(encoding_aes_key: &str) -> Result<Self, KeyError> {
        let trimmed = encoding_aes_key.trim();
        if trimmed.len() != 43 {
            return Err(KeyError::InvalidLength(trimmed.len()));
        }
        let raw = KEY_ENGINE
            .decode(format!("{trimmed}=").as_bytes())
            .map_err(|e| KeyError::Base64(e.to_string()))?;
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidKeyBytes(raw.len()))?;
        Ok(Self(bytes))
    }

    /// Random key whose EncodingAESKey form is alphanumeric only.
    pub fn generate() -> Self {
        loop {
            let mut bytes = [0u8; 32];
            rand::rng().fill_bytes(&mut bytes);
            let key = Self(bytes);
            if !key.is_zero()
                && key
                    .to_encoding_aes_key()
                    .bytes()
                    .all(|b| b.is_ascii_alphanumeric())
            {
                return key;
            }
        }
    }

    /// The 43-char EncodingAESKey form of this key.
    pub fn to_encoding_aes_key(&self) -> String {
        BASE64.encode(self.0).trim_end_matches('=').to_string()
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// CBC initialisation vector: the first 16 bytes of the key.
    pub fn iv(&self) -> &[u8] {
        &self.0[..16]
    }
}

/// Generate a 43-character EncodingAESKey made of [A-Za-z0-9] only.
pub fn generate_encoding_aes_key() -> String {
    AesKey::generate().to_encoding_aes_key()
}

/// Verify the provided EncodingAESKey format:
/// - exactly 43 characters
/// - Base64-decodes to 32 bytes after appending '='
pub fn verify_encoding_aes_key(key: &str) -> bool {
    AesKey::from_encoding_aes_key(key).is_ok()
}

/// Generate an alphanumeric Token of given length (default 32; allowed 1..=32).
pub fn generate_token(len: usize) -> String {
    let len = if len == 0 || len > 32 { 32 } else { len };
    Alphanumeric.sample_string(&mut rand::rng(), len)
}

/// Current and previous key as one value.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct KeyPair {
    pub current: AesKey,
    /// Zero until the first rotation.
    pub previous: AesKey,
}

/// Key rotation store read by the callback verifier on every request.
#[derive(Debug, Default)]
pub struct KeyRing {
    pair: RwLock<KeyPair>,
}

impl KeyRing {
    pub fn new(current: AesKey) -> Self {
        Self::with_previous(current, AesKey::ZERO)
    }

    /// Start from a known pair, e.g. after a restart mid-rotation.
    pub fn with_previous(current: AesKey, previous: AesKey) -> Self {
        Self {
            pair: RwLock::new(KeyPair { current, previous }),
        }
    }

    pub fn current_key(&self) -> AesKey {
        self.pair.read().current
    }

    pub fn previous_key(&self) -> AesKey {
        self.pair.read().previous
    }

    /// Both keys as read under one lock acquisition.
    pub fn snapshot(&self) -> KeyPair {
        *self.pair.read()
    }

    /// Shift current into previous, then install `new_key` as current.
    pub fn rotate(&self, new_key: AesKey) {
        let mut pair = self.pair.write();
        pair.previous = pair.current;
        pair.current = new_key;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> AesKey {
        AesKey::new([byte; 32])
    }

    #[test]
    fn token_alnum_and_length() {
        for &len in &[8usize, 16, 32] {
            let t = generate_token(len);
            assert_eq!(t.len(), len);
            assert!(t.chars().all(|ch| ch.is_ascii_alphanumeric()));
        }
        // length above max clamps to 32
        assert_eq!(generate_token(64).len(), 32);
        // length 0 defaults to 32
        assert_eq!(generate_token(0).len(), 32);
    }

    #[test]
    fn encoding_aes_key_generation_and_verify() {
        let encoded = generate_encoding_aes_key();
        assert_eq!(encoded.len(), 43);
        assert!(encoded.bytes().all(|b| b.is_ascii_alphanumeric()));
        assert!(verify_encoding_aes_key(&encoded));

        let decoded = AesKey::from_encoding_aes_key(&encoded).unwrap();
        assert_eq!(decoded.to_encoding_aes_key(), encoded);
    }

    #[test]
    fn rejects_wrong_length_keys() {
        assert_eq!(
            AesKey::from_encoding_aes_key("short"),
            Err(KeyError::InvalidLength(5))
        );
        assert!(!verify_encoding_aes_key(&"a".repeat(44)));
    }

    #[test]
    fn debug_does_not_leak_key_material() {
        assert_eq!(format!("{:?}", AesKey::ZERO), "AesKey(zero)");
        assert_eq!(format!("{:?}", key(7)), "AesKey(***)");
    }

    #[test]
    fn rotate_shifts_current_into_previous() {
        let ring = KeyRing::new(key(1));
        assert!(ring.previous_key().is_zero());

        ring.rotate(key(2));
        ring.rotate(key(3));
        assert_eq!(ring.current_key(), key(3));
        assert_eq!(ring.previous_key(), key(2));
    }

    #[test]
    fn concurrent_readers_never_see_previous_equal_to_new_current() {
        use std::sync::Arc;

        let ring = Arc::new(KeyRing::new(key(1)));
        let writer = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                for b in 2..=200u8 {
                    ring.rotate(key(b));
                }
            })
        };
        let reader = {
            let ring = Arc::clone(&ring);
            std::thread::spawn(move || {
                for _ in 0..10_000 {
                    let pair = ring.snapshot();
                    assert_ne!(pair.current, pair.previous);
                }
            })
        };
        writer.join().unwrap();
        reader.join().unwrap();
    }
}
