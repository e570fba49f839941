//! Callback message crypto
//!
//! Features:
//! - Signature computation (SHA1 over lexicographically sorted parts)
//! - Constant-time signature verification
//! - AES-256-CBC encryption/decryption of the platform frame
//! - Encrypted passive-reply envelope
//!
//! Plaintext frame (before PKCS#7 padding to a 32-byte block):
//! 16B random | 4B big-endian msg_len | msg(msg_len) | receiver_id

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use thiserror::Error;

use aes::Aes256;
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};

use crate::keys::AesKey;

type Aes256CbcDec = cbc::Decryptor<Aes256>;
type Aes256CbcEnc = cbc::Encryptor<Aes256>;

/// PKCS#7 block size used by the platform (not the AES block size).
pub const PAD_BLOCK_SIZE: usize = 32;
/// Length of the random prefix in every frame.
pub const RANDOM_LEN: usize = 16;

const LEN_PREFIX: usize = 4;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("invalid base64: {0}")]
    Base64(String),
    #[error("ciphertext length {0} is not a positive multiple of the AES block size")]
    CipherLength(usize),
    #[error("crypto error")]
    Crypto,
    #[error("invalid padding")]
    Padding,
    #[error("bad message frame")]
    BadFrame,
}

/// Result of opening one encrypted frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decrypted {
    /// Random prefix chosen by the sender
    pub random: [u8; RANDOM_LEN],
    /// Message bytes (usually XML)
    pub message: Vec<u8>,
    /// Trailing receiver id (suite id, corp id or appid)
    pub receiver_id: Vec<u8>,
}

/// Compute SHA1 signature by sorting parts lexicographically and concatenating.
pub fn sha1_signature(parts: &[&str]) -> String {
    let mut v = parts.to_vec();
    v.sort_unstable();
    let mut hasher = Sha1::new();
    for p in v {
        hasher.update(p.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Signature over an encrypted payload (`msg_signature`).
pub fn msg_signature(token: &str, timestamp: &str, nonce: &str, encrypt: &str) -> String {
    sha1_signature(&[token, timestamp, nonce, encrypt])
}

/// Whether `signature` is exactly 40 hex characters.
pub fn is_well_formed_signature(signature: &str) -> bool {
    signature.len() == 40 && signature.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Compare a computed signature to the supplied one in constant time (case-sensitive).
pub fn signature_matches(expected: &str, supplied: &str) -> bool {
    constant_time_eq(expected.as_bytes(), supplied.as_bytes())
}

/// Verify URL signature (no encrypt parameter).
pub fn verify_url_signature(token: &str, timestamp: &str, nonce: &str, signature: &str) -> bool {
    signature_matches(&sha1_signature(&[token, timestamp, nonce]), signature)
}

/// Verify message signature (includes encrypt parameter).
pub fn verify_msg_signature(
    token: &str,
    timestamp: &str,
    nonce: &str,
    encrypt: &str,
    signature: &str,
) -> bool {
    signature_matches(&msg_signature(token, timestamp, nonce, encrypt), signature)
}

/// Constant-time byte comparison. Inputs of different lengths compare unequal.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Decode base64 ciphertext, tolerating the URL-safe alphabet and missing padding.
pub fn decode_base64(cipher_b64: &str) -> Result<Vec<u8>, CryptoError> {
    let mut normalized = cipher_b64.trim().replace('-', "+").replace('_', "/");
    match normalized.len() % 4 {
        2 => normalized.push_str("=="),
        3 => normalized.push('='),
        _ => {}
    }
    BASE64
        .decode(normalized.as_bytes())
        .map_err(|e| CryptoError::Base64(e.to_string()))
}

/// Decrypt one frame with `key`.
pub fn decrypt(key: &AesKey, ciphertext: &[u8]) -> Result<Decrypted, CryptoError> {
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(CryptoError::CipherLength(ciphertext.len()));
    }
    let mut buf = ciphertext.to_vec();
    let plaintext = Aes256CbcDec::new_from_slices(key.as_bytes(), key.iv())
        .map_err(|_| CryptoError::Crypto)?
        .decrypt_padded_mut::<NoPadding>(&mut buf)
        .map_err(|_| CryptoError::Crypto)?;
    let plaintext = pkcs7_unpad(plaintext)?;

    if plaintext.len() < RANDOM_LEN + LEN_PREFIX {
        return Err(CryptoError::BadFrame);
    }
    let mut random = [0u8; RANDOM_LEN];
    random.copy_from_slice(&plaintext[..RANDOM_LEN]);

    let content = &plaintext[RANDOM_LEN..];
    let msg_len = u32::from_be_bytes([content[0], content[1], content[2], content[3]]) as usize;
    let msg_end = LEN_PREFIX
        .checked_add(msg_len)
        .ok_or(CryptoError::BadFrame)?;
    if content.len() < msg_end {
        return Err(CryptoError::BadFrame);
    }

    Ok(Decrypted {
        random,
        message: content[LEN_PREFIX..msg_end].to_vec(),
        receiver_id: content[msg_end..].to_vec(),
    })
}

/// Encrypt one frame with `key`.
pub fn encrypt(
    key: &AesKey,
    random: &[u8; RANDOM_LEN],
    message: &[u8],
    receiver_id: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let msg_len = u32::try_from(message.len()).map_err(|_| CryptoError::BadFrame)?;
    let mut frame =
        Vec::with_capacity(RANDOM_LEN + LEN_PREFIX + message.len() + receiver_id.len() + 32);
    frame.extend_from_slice(random);
    frame.extend_from_slice(&msg_len.to_be_bytes());
    frame.extend_from_slice(message);
    frame.extend_from_slice(receiver_id);
    pkcs7_pad(&mut frame);

    let len = frame.len();
    Aes256CbcEnc::new_from_slices(key.as_bytes(), key.iv())
        .map_err(|_| CryptoError::Crypto)?
        .encrypt_padded_mut::<NoPadding>(&mut frame, len)
        .map_err(|_| CryptoError::Crypto)?;
    Ok(frame)
}

/// Encrypt and base64-encode, as carried in `Encrypt` fields and `echostr`.
pub fn encrypt_to_base64(
    key: &AesKey,
    random: &[u8; RANDOM_LEN],
    message: &[u8],
    receiver_id: &[u8],
) -> Result<String, CryptoError> {
    Ok(BASE64.encode(encrypt(key, random, message, receiver_id)?))
}

/// Build the encrypted passive-reply XML for `message`.
pub fn encrypt_reply(
    token: &str,
    key: &AesKey,
    receiver_id: &str,
    message: &[u8],
    timestamp: &str,
    nonce: &str,
) -> Result<String, CryptoError> {
    let mut random = [0u8; RANDOM_LEN];
    rand::RngCore::fill_bytes(&mut rand::rng(), &mut random);
    let encrypt = encrypt_to_base64(key, &random, message, receiver_id.as_bytes())?;
    let signature = msg_signature(token, timestamp, nonce, &encrypt);
    Ok(format!(
        "<xml><Encrypt><![CDATA[{encrypt}]]></Encrypt><MsgSignature><![CDATA[{signature}]]></MsgSignature><TimeStamp>{timestamp}</TimeStamp><Nonce><![CDATA[{nonce}]]></Nonce></xml>"
    ))
}

fn pkcs7_pad(buf: &mut Vec<u8>) {
    let pad = PAD_BLOCK_SIZE - buf.len() % PAD_BLOCK_SIZE;
    buf.extend(std::iter::repeat_n(pad as u8, pad));
}

fn pkcs7_unpad(buf: &[u8]) -> Result<&[u8], CryptoError> {
    let Some(&last) = buf.last() else {
        return Err(CryptoError::Padding);
    };
    let pad = last as usize;
    if pad == 0 || pad > PAD_BLOCK_SIZE || pad > buf.len() {
        return Err(CryptoError::Padding);
    }
    let (body, padding) = buf.split_at(buf.len() - pad);
    if padding.iter().any(|b| *b != last) {
        return Err(CryptoError::Padding);
    }
    Ok(body)
}
