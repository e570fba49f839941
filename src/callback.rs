//! Inbound callback verification and dispatch.
//!
//! [`CallbackVerifier`] authenticates platform pushes, decrypts them with the
//! current key (falling back to the previous one during a rotation), checks the
//! receiver id, and hands the result to a [`Dispatcher`].
//!
//! Two entry points:
//! - [`CallbackVerifier::verify_url`]: GET used once to prove endpoint ownership;
//!   the decrypted `echostr` is the response body.
//! - [`CallbackVerifier::handle_push`]: POST carrying an encrypted message or event.
//!
//! Every rejection goes through one pluggable invalid-request hook and never
//! reaches a handler.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::crypto::{self, CryptoError, Decrypted, RANDOM_LEN};
use crate::envelope::{self, Envelope, EnvelopeError};
use crate::keys::{AesKey, KeyRing};
use crate::token::redact_id;

/// Query parameters sent with every callback
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub msg_signature: Option<String>,
    /// Plain-mode signature (no encryption)
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub nonce: Option<String>,
    #[serde(default)]
    pub echostr: Option<String>,
}

/// Why a callback was rejected.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("invalid request: missing query parameter `{0}`")]
    MissingParameter(&'static str),

    #[error("invalid request: signature must be 40 hex characters")]
    MalformedSignature,

    #[error("invalid request: signature mismatch")]
    SignatureMismatch,

    #[error("invalid request: aes key not initialized")]
    KeyNotReady,

    #[error("invalid request: decrypt failed: {0}")]
    Decrypt(#[source] CryptoError),

    #[error("invalid request: receiver id length mismatch (expected {expected}, got {actual})")]
    IdentifierLengthMismatch { expected: usize, actual: usize },

    #[error("invalid request: receiver id mismatch")]
    IdentifierMismatch,

    #[error("invalid request: bad body: {0}")]
    Body(#[source] EnvelopeError),

    #[error("invalid request: bad envelope: {0}")]
    Envelope(#[source] EnvelopeError),
}

/// Everything a handler learns about one verified push.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Decrypted message bytes
    pub plaintext: Vec<u8>,
    pub envelope: Envelope,
    pub timestamp: String,
    pub nonce: String,
    /// Key that decrypted the message (use it to encrypt a passive reply)
    pub aes_key: AesKey,
    /// Random prefix of the decrypted frame
    pub random: [u8; RANDOM_LEN],
    /// Receiver id embedded in the frame
    pub receiver_id: String,
}

/// What to write back to the platform after dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The literal `success` acknowledgement
    Success,
    /// Custom body, e.g. an encrypted passive reply
    Body(Vec<u8>),
    /// Empty body; the platform will redeliver
    Empty,
}

impl Reply {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Reply::Success => b"success".to_vec(),
            Reply::Body(body) => body,
            Reply::Empty => Vec::new(),
        }
    }
}

/// Handler for one kind of verified message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: &MessageContext) -> anyhow::Result<Reply>;
}

/// Fallback used for kinds nobody registered.
#[derive(Debug, Default)]
pub struct UnknownKindHandler;

#[async_trait]
impl MessageHandler for UnknownKindHandler {
    async fn handle(&self, ctx: &MessageContext) -> anyhow::Result<Reply> {
        warn!(kind = ctx.envelope.kind(), "no handler registered for callback kind");
        Ok(Reply::Success)
    }
}

/// Routes verified messages by [`Envelope::kind`].
#[derive(Clone)]
pub struct Dispatcher {
    handlers: HashMap<String, Arc<dyn MessageHandler>>,
    fallback: Arc<dyn MessageHandler>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
            fallback: Arc::new(UnknownKindHandler),
        }
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind` (an InfoType or MsgType value).
    pub fn on(mut self, kind: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        self.handlers.insert(kind.into(), handler);
        self
    }

    /// Replace the handler used for unregistered kinds.
    pub fn with_fallback(mut self, handler: Arc<dyn MessageHandler>) -> Self {
        self.fallback = handler;
        self
    }

    /// Run the matching handler. Handler failures are logged and answered
    /// with an empty body so the platform redelivers.
    pub async fn dispatch(&self, ctx: &MessageContext) -> Reply {
        let kind = ctx.envelope.kind();
        let handler = self.handlers.get(kind).unwrap_or(&self.fallback);
        match handler.handle(ctx).await {
            Ok(reply) => reply,
            Err(e) => {
                error!(kind, "callback handler failed: {e:#}");
                Reply::Empty
            }
        }
    }
}

/// Hook invoked once for every rejected request.
pub type InvalidRequestHandler = Arc<dyn Fn(&VerifyError) + Send + Sync>;

fn log_invalid_request(err: &VerifyError) {
    warn!("rejected callback: {err}");
}

/// Verifies, decrypts and dispatches platform callbacks.
pub struct CallbackVerifier {
    token: String,
    receiver_id: String,
    keys: Arc<KeyRing>,
    dispatcher: Dispatcher,
    on_invalid: InvalidRequestHandler,
}

impl fmt::Debug for CallbackVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackVerifier")
            .field("receiver_id", &self.receiver_id)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

impl CallbackVerifier {
    /// - token: the callback Token configured on the platform
    /// - receiver_id: suite id / corp id expected at the tail of every decrypted push
    pub fn new(
        token: impl Into<String>,
        receiver_id: impl Into<String>,
        keys: Arc<KeyRing>,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            token: token.into(),
            receiver_id: receiver_id.into(),
            keys,
            dispatcher,
            on_invalid: Arc::new(log_invalid_request),
        }
    }

    /// Replace the invalid-request hook (default: log a warning).
    pub fn on_invalid_request(mut self, hook: InvalidRequestHandler) -> Self {
        self.on_invalid = hook;
        self
    }

    pub fn keys(&self) -> &Arc<KeyRing> {
        &self.keys
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn receiver_id(&self) -> &str {
        &self.receiver_id
    }

    /// URL verification (GET). Returns the body to write back.
    ///
    /// With `msg_signature` the echo is encrypted and gets decrypted; with only
    /// `signature` (plain mode) the echo is returned verbatim.
    pub fn verify_url(&self, query: &CallbackQuery) -> Result<Vec<u8>, VerifyError> {
        self.verify_url_inner(query).inspect_err(|e| self.reject(e))
    }

    /// Message push (POST). Returns the reply to write back.
    pub async fn handle_push(
        &self,
        query: &CallbackQuery,
        body: &[u8],
    ) -> Result<Reply, VerifyError> {
        let ctx = self.open_push(query, body).inspect_err(|e| self.reject(e))?;
        debug!(kind = ctx.envelope.kind(), "callback verified");
        Ok(self.dispatcher.dispatch(&ctx).await)
    }

    fn reject(&self, err: &VerifyError) {
        (self.on_invalid)(err);
    }

    fn verify_url_inner(&self, query: &CallbackQuery) -> Result<Vec<u8>, VerifyError> {
        let timestamp = required(&query.timestamp, "timestamp")?;
        let nonce = required(&query.nonce, "nonce")?;
        let echostr = required(&query.echostr, "echostr")?;

        let Some(msg_signature) = query.msg_signature.as_deref() else {
            let signature = required(&query.signature, "msg_signature")?;
            check_signature_shape(signature)?;
            if !crypto::verify_url_signature(&self.token, timestamp, nonce, signature) {
                return Err(VerifyError::SignatureMismatch);
            }
            return Ok(echostr.as_bytes().to_vec());
        };

        check_signature_shape(msg_signature)?;
        if !crypto::verify_msg_signature(&self.token, timestamp, nonce, echostr, msg_signature) {
            return Err(VerifyError::SignatureMismatch);
        }
        let ciphertext = crypto::decode_base64(echostr).map_err(VerifyError::Decrypt)?;
        let (opened, _) = self.decrypt_with_fallback(&ciphertext)?;
        // Not checked here: nothing is dispatched from an echo.
        debug!(
            receiver_id = %redact_id(&String::from_utf8_lossy(&opened.receiver_id)),
            "url verification echo decrypted"
        );
        Ok(opened.message)
    }

    fn open_push(&self, query: &CallbackQuery, body: &[u8]) -> Result<MessageContext, VerifyError> {
        let signature = query
            .msg_signature
            .as_deref()
            .or(query.signature.as_deref())
            .filter(|s| !s.is_empty())
            .ok_or(VerifyError::MissingParameter("msg_signature"))?;
        let timestamp = required(&query.timestamp, "timestamp")?;
        let nonce = required(&query.nonce, "nonce")?;
        check_signature_shape(signature)?;

        let encrypt = envelope::extract_ciphertext(body).map_err(VerifyError::Body)?;
        if !crypto::verify_msg_signature(&self.token, timestamp, nonce, &encrypt, signature) {
            return Err(VerifyError::SignatureMismatch);
        }

        let ciphertext = crypto::decode_base64(&encrypt).map_err(VerifyError::Decrypt)?;
        let (opened, aes_key) = self.decrypt_with_fallback(&ciphertext)?;
        let envelope = Envelope::parse(&opened.message).map_err(VerifyError::Envelope)?;
        check_identifier(
            self.receiver_id.as_bytes(),
            &opened.receiver_id,
            crypto::constant_time_eq,
        )?;

        Ok(MessageContext {
            envelope,
            timestamp: timestamp.to_string(),
            nonce: nonce.to_string(),
            aes_key,
            random: opened.random,
            receiver_id: String::from_utf8_lossy(&opened.receiver_id).into_owned(),
            plaintext: opened.message,
        })
    }

    /// Try the current key, then the previous one if it is set and different.
    fn decrypt_with_fallback(&self, ciphertext: &[u8]) -> Result<(Decrypted, AesKey), VerifyError> {
        let pair = self.keys.snapshot();
        if pair.current.is_zero() {
            return Err(VerifyError::KeyNotReady);
        }
        match crypto::decrypt(&pair.current, ciphertext) {
            Ok(opened) => Ok((opened, pair.current)),
            Err(first) => {
                if pair.previous.is_zero() || pair.previous == pair.current {
                    return Err(VerifyError::Decrypt(first));
                }
                debug!("current key failed ({first}); trying previous key");
                crypto::decrypt(&pair.previous, ciphertext)
                    .map(|opened| (opened, pair.previous))
                    .map_err(VerifyError::Decrypt)
            }
        }
    }
}

fn required<'a>(value: &'a Option<String>, name: &'static str) -> Result<&'a str, VerifyError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or(VerifyError::MissingParameter(name))
}

fn check_signature_shape(signature: &str) -> Result<(), VerifyError> {
    if crypto::is_well_formed_signature(signature) {
        Ok(())
    } else {
        Err(VerifyError::MalformedSignature)
    }
}

/// Lengths are compared first; `compare` only ever sees equal-length inputs.
fn check_identifier(
    expected: &[u8],
    actual: &[u8],
    compare: impl FnOnce(&[u8], &[u8]) -> bool,
) -> Result<(), VerifyError> {
    if expected.len() != actual.len() {
        return Err(VerifyError::IdentifierLengthMismatch {
            expected: expected.len(),
            actual: actual.len(),
        });
    }
    if !compare(expected, actual) {
        return Err(VerifyError::IdentifierMismatch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TOKEN: &str = "QDG6eK";
    const SUITE_ID: &str = "wwsuite0001";

    fn key(byte: u8) -> AesKey {
        AesKey::new([byte; 32])
    }

    fn verifier(keys: KeyRing) -> CallbackVerifier {
        CallbackVerifier::new(TOKEN, SUITE_ID, Arc::new(keys), Dispatcher::new())
    }

    fn signed_query(encrypt: &str) -> CallbackQuery {
        CallbackQuery {
            msg_signature: Some(crypto::msg_signature(TOKEN, "1409659813", "263014780", encrypt)),
            timestamp: Some("1409659813".into()),
            nonce: Some("263014780".into()),
            ..Default::default()
        }
    }

    #[test]
    fn identifier_length_mismatch_skips_comparator() {
        let calls = AtomicUsize::new(0);
        let result = check_identifier(b"wwsuite0001", b"wwsuite", |a, b| {
            calls.fetch_add(1, Ordering::SeqCst);
            a == b
        });
        assert!(matches!(
            result,
            Err(VerifyError::IdentifierLengthMismatch { expected: 11, actual: 7 })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn identifier_equal_length_uses_comparator_once() {
        let calls = AtomicUsize::new(0);
        let result = check_identifier(b"wwsuite0001", b"wwsuite0002", |a, b| {
            calls.fetch_add(1, Ordering::SeqCst);
            crypto::constant_time_eq(a, b)
        });
        assert!(matches!(result, Err(VerifyError::IdentifierMismatch)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(check_identifier(b"ww", b"ww", crypto::constant_time_eq).is_ok());
    }

    #[test]
    fn zero_current_key_is_not_ready() {
        let v = verifier(KeyRing::default());
        let encrypt = crypto::encrypt_to_base64(&key(1), &[0; 16], b"echo", b"x").unwrap();
        let mut query = signed_query(&encrypt);
        query.echostr = Some(encrypt);
        assert!(matches!(v.verify_url(&query), Err(VerifyError::KeyNotReady)));
    }

    #[test]
    fn previous_key_equal_to_current_is_not_retried() {
        let v = verifier(KeyRing::with_previous(key(1), key(1)));
        let ciphertext = crypto::encrypt(&key(2), &[0; 16], b"echo", b"x").unwrap();
        assert!(matches!(
            v.decrypt_with_fallback(&ciphertext),
            Err(VerifyError::Decrypt(_))
        ));
    }

    #[test]
    fn previous_key_is_used_after_rotation() {
        let ring = KeyRing::new(key(1));
        ring.rotate(key(2));
        let v = verifier(ring);
        let ciphertext = crypto::encrypt(&key(1), &[3; 16], b"echo", b"x").unwrap();
        let (opened, used) = v.decrypt_with_fallback(&ciphertext).unwrap();
        assert_eq!(opened.message, b"echo");
        assert_eq!(used, key(1));
    }

    #[test]
    fn plain_mode_echo_is_returned_verbatim() {
        let v = verifier(KeyRing::default());
        let query = CallbackQuery {
            signature: Some(crypto::sha1_signature(&[TOKEN, "1", "2"])),
            timestamp: Some("1".into()),
            nonce: Some("2".into()),
            echostr: Some("hello-echo".into()),
            ..Default::default()
        };
        assert_eq!(v.verify_url(&query).unwrap(), b"hello-echo");
    }

    #[test]
    fn missing_and_malformed_parameters_are_rejected() {
        let v = verifier(KeyRing::new(key(1)));
        let rejected = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&rejected);
        let v = v.on_invalid_request(Arc::new(move |_: &VerifyError| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let mut query = signed_query("abc");
        assert!(matches!(
            v.verify_url(&query),
            Err(VerifyError::MissingParameter("echostr"))
        ));

        query.echostr = Some("abc".into());
        query.msg_signature = Some("deadbeef".into());
        assert!(matches!(v.verify_url(&query), Err(VerifyError::MalformedSignature)));

        assert_eq!(rejected.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn reply_bytes() {
        assert_eq!(Reply::Success.into_bytes(), b"success");
        assert_eq!(Reply::Body(b"x".to_vec()).into_bytes(), b"x");
        assert!(Reply::Empty.into_bytes().is_empty());
    }
}
