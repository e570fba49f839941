//! Callback envelopes.
//!
//! Two layers arrive on the push endpoint:
//! - the outer wrapper carrying the ciphertext, which may be a bare base64 body,
//!   `<xml><Encrypt>..</Encrypt></xml>`, or `{"encrypt": ".."}`;
//! - the decrypted XML message/event, parsed into [`Envelope`].

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("empty request body")]
    EmptyBody,
    #[error("request body is not utf-8")]
    Utf8,
    #[error("xml parse error: {0}")]
    Xml(String),
    #[error("json parse error: {0}")]
    Json(String),
    #[error("missing Encrypt field")]
    MissingEncrypt,
}

/// Decrypted message or event
///
/// Only the routing and identity fields are typed; handlers that need the
/// rest parse `MessageContext::plaintext` themselves.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(rename = "xml", rename_all = "PascalCase", default)]
pub struct Envelope {
    /// Suite id on suite events
    pub suite_id: String,
    /// Suite event kind: suite_ticket, create_auth, change_auth, cancel_auth, ...
    pub info_type: String,
    /// Unix seconds as sent by the platform
    pub time_stamp: String,
    /// Present when `info_type == "suite_ticket"`
    pub suite_ticket: String,
    pub auth_code: String,
    pub auth_corp_id: String,
    /// Receiver corp id / account on app messages
    pub to_user_name: String,
    pub from_user_name: String,
    pub create_time: String,
    /// Message kind on app messages: text, image, event, ...
    pub msg_type: String,
    pub event: String,
    #[serde(rename = "AgentID")]
    pub agent_id: String,
}

impl Envelope {
    pub fn parse(xml: &[u8]) -> Result<Self, EnvelopeError> {
        let text = std::str::from_utf8(xml).map_err(|_| EnvelopeError::Utf8)?;
        quick_xml::de::from_str(text).map_err(|e| EnvelopeError::Xml(e.to_string()))
    }

    /// Key used to route the envelope: the suite `InfoType`, else `MsgType`.
    pub fn kind(&self) -> &str {
        if self.info_type.is_empty() {
            &self.msg_type
        } else {
            &self.info_type
        }
    }

    /// Application identity declared in the envelope: `SuiteId`, else `ToUserName`.
    pub fn identifier(&self) -> &str {
        if self.suite_id.is_empty() {
            &self.to_user_name
        } else {
            &self.suite_id
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename = "xml")]
struct EncryptedXml {
    #[serde(rename = "Encrypt", default)]
    encrypt: String,
}

/// Detect callback wrapper format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapperFormat {
    Xml,
    Json,
    Raw,
}

pub fn detect_format(body: &str) -> WrapperFormat {
    let s = body.trim_start();
    if s.starts_with('<') {
        WrapperFormat::Xml
    } else if s.starts_with('{') {
        WrapperFormat::Json
    } else {
        WrapperFormat::Raw
    }
}

/// Pull the base64 ciphertext out of a push body.
pub fn extract_ciphertext(body: &[u8]) -> Result<String, EnvelopeError> {
    let text = std::str::from_utf8(body).map_err(|_| EnvelopeError::Utf8)?;
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(EnvelopeError::EmptyBody);
    }
    let encrypt = match detect_format(trimmed) {
        WrapperFormat::Xml => {
            let wrapper: EncryptedXml =
                quick_xml::de::from_str(trimmed).map_err(|e| EnvelopeError::Xml(e.to_string()))?;
            wrapper.encrypt
        }
        WrapperFormat::Json => extract_encrypt_from_json(trimmed)?,
        WrapperFormat::Raw => trimmed.to_string(),
    };
    let encrypt = encrypt.trim();
    if encrypt.is_empty() {
        return Err(EnvelopeError::MissingEncrypt);
    }
    Ok(encrypt.to_string())
}

/// Extract Encrypt/encrypt field from a JSON body.
fn extract_encrypt_from_json(s: &str) -> Result<String, EnvelopeError> {
    let v: serde_json::Value =
        serde_json::from_str(s).map_err(|e| EnvelopeError::Json(e.to_string()))?;
    ["Encrypt", "encrypt"]
        .iter()
        .find_map(|k| v.get(k).and_then(|x| x.as_str()))
        .map(str::to_string)
        .ok_or(EnvelopeError::MissingEncrypt)
}
