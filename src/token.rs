//! Token issuance for WeCom third-party suites and WeChat apps.
//!
//! Provides the HTTP client used to obtain credentials, plus the
//! [`TokenSource`] capability consumed by the background refresher.
//!
//! Design:
//! - `SuiteClient` handles HTTP and basic error mapping; caching and refresh
//!   live in [`crate::refresher`].
//! - `SuiteTokenSource` issues `suite_access_token` and needs the suite ticket
//!   pushed by the platform.
//! - `AccessTokenSource` issues `access_token` from client credentials
//!   (Official Account / Mini Program, or WeCom corp).
//!
//! Endpoints:
//! - Suite: POST https://qyapi.weixin.qq.com/cgi-bin/service/get_suite_token
//!   body: {"suite_id", "suite_secret", "suite_ticket"}
//! - Official Account / Mini Program: GET https://api.weixin.qq.com/cgi-bin/token?grant_type=client_credential&appid=APPID&secret=APPSECRET
//! - WeCom corp: GET https://qyapi.weixin.qq.com/cgi-bin/gettoken?corpid=CORP_ID&corpsecret=CORP_SECRET
//!
//! Example (pseudo usage):
//! ```ignore
//! use std::sync::Arc;
//! use wxsuite_rs::{SuiteAuth, SuiteClient, SuiteTokenSource, TicketHolder, TokenSource};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ticket = Arc::new(TicketHolder::new());
//!     ticket.set_if_non_empty("ticket-from-callback");
//!     let source = SuiteTokenSource::new(
//!         SuiteClient::default(),
//!         SuiteAuth { suite_id: "wwsuite".into(), suite_secret: "secret".into() },
//!         ticket,
//!     );
//!     let issued = source.issue().await?;
//!     println!("expires_in: {}", issued.expires_in);
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use crate::errors;
use crate::ticket::TicketHolder;

/// Default upper bound for a single token request.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

const QYAPI_BASE: &str = "https://qyapi.weixin.qq.com";
const MP_API_BASE: &str = "https://api.weixin.qq.com";

/// Client-credential authentication
///
/// - OfficialAccount: Official Account / Mini Program uses appid + appsecret
/// - WeCom: WeCom corp uses corp_id + corp_secret
#[derive(Clone, Debug)]
pub enum Auth {
    /// Official Account / Mini Program
    OfficialAccount { appid: String, secret: String },
    /// WeCom corp (self-built application)
    WeCom {
        corp_id: String,
        corp_secret: String,
    },
}

impl Auth {
    /// The identifier this credential is scoped to.
    pub fn scope(&self) -> String {
        match self {
            Auth::OfficialAccount { appid, .. } => format!("oa:{}", appid),
            Auth::WeCom { corp_id, .. } => format!("wecom:{}", corp_id),
        }
    }
}

/// Third-party suite identity
#[derive(Clone, Debug)]
pub struct SuiteAuth {
    pub suite_id: String,
    pub suite_secret: String,
}

/// A freshly issued credential as reported by the platform
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct IssuedToken {
    /// Token string (`access_token` or `suite_access_token`)
    #[serde(alias = "suite_access_token")]
    pub access_token: String,
    /// Lifetime in seconds; must be positive
    pub expires_in: i64,
}

/// WeChat API error body
#[derive(Clone, Debug, Deserialize)]
pub struct WxError {
    pub errcode: i64,
    pub errmsg: String,
}

/// Raw token response (either success or error)
#[derive(Clone, Debug, Deserialize)]
#[serde(untagged)]
enum TokenRawResp {
    Ok(IssuedToken),
    Err(WxError),
}

#[derive(Serialize)]
struct SuiteTokenRequest<'a> {
    suite_id: &'a str,
    suite_secret: &'a str,
    suite_ticket: &'a str,
}

/// Unified error type for token issuance
#[derive(Debug, Error)]
pub enum Error {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unexpected http status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("weixin error {code}: {message}")]
    Wx { code: i64, message: String },

    #[error("unexpected token response (status {status}): {error}; body: {body}")]
    UnexpectedTokenResponse {
        status: u16,
        error: String,
        body: String,
    },

    #[error("expires_in must be positive, got {0}")]
    NonPositiveExpiresIn(i64),

    #[error("suite ticket not yet configured")]
    TicketNotConfigured,

    #[error("token request timed out after {0:?}")]
    Timeout(Duration),
}

impl Error {
    /// Whether the platform reported that the token itself is invalid or expired.
    pub fn should_refresh_token(&self) -> bool {
        match self {
            Error::Wx { code, .. } => errors::should_refresh_token(*code),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Something that can mint a new credential on demand.
///
/// The refresher owns the schedule; implementations only perform one
/// issuance per call and must not cache.
#[async_trait]
pub trait TokenSource: Send + Sync + 'static {
    /// Call the remote issuing endpoint once.
    async fn issue(&self) -> Result<IssuedToken>;

    /// Identity the issued credential belongs to (for logs and cache keys).
    fn scope(&self) -> String;
}

/// HTTP client for the token endpoints
///
/// - Wraps `reqwest::Client`
/// - Provides token fetching (no caching/auto-refresh here)
#[derive(Clone, Debug)]
pub struct SuiteClient {
    http: reqwest::Client,
    qyapi_base: Url,
    mp_base: Url,
}

impl Default for SuiteClient {
    fn default() -> Self {
        Self::new(DEFAULT_HTTP_TIMEOUT).expect("reqwest::Client build must succeed")
    }
}

impl SuiteClient {
    /// Build a client whose requests are bounded by `timeout`.
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .timeout(timeout)
            .build()?;
        Ok(Self::with_http(http))
    }

    /// Use a custom `reqwest::Client`
    pub fn with_http(http: reqwest::Client) -> Self {
        Self {
            http,
            qyapi_base: Url::parse(QYAPI_BASE).expect("static url"),
            mp_base: Url::parse(MP_API_BASE).expect("static url"),
        }
    }

    /// Point both API hosts at `base` (useful for proxies and test servers).
    pub fn with_base_url(mut self, base: &str) -> Result<Self> {
        let url = Url::parse(base).map_err(|e| Error::InvalidUrl(e.to_string()))?;
        self.qyapi_base = url.clone();
        self.mp_base = url;
        Ok(self)
    }

    /// Fetch `suite_access_token`
    ///
    /// POST {qyapi}/cgi-bin/service/get_suite_token (do not log secrets or tickets)
    #[instrument(level = "debug", skip(self, auth, ticket), fields(suite = %redact_id(&auth.suite_id)))]
    pub async fn get_suite_token(&self, auth: &SuiteAuth, ticket: &str) -> Result<IssuedToken> {
        if ticket.is_empty() {
            return Err(Error::TicketNotConfigured);
        }
        let url = self
            .qyapi_base
            .join("cgi-bin/service/get_suite_token")
            .map_err(|e| Error::InvalidUrl(e.to_string()))?;
        let body = SuiteTokenRequest {
            suite_id: &auth.suite_id,
            suite_secret: &auth.suite_secret,
            suite_ticket: ticket,
        };
        debug!("requesting suite_access_token");
        self.request_token(self.http.post(url).json(&body)).await
    }

    /// Fetch access_token from client credentials
    ///
    /// - Official Account / Mini Program:
    ///   GET {mp}/cgi-bin/token, params: grant_type=client_credential, appid, secret
    ///
    /// - WeCom corp:
    ///   GET {qyapi}/cgi-bin/gettoken, params: corpid, corpsecret
    #[instrument(level = "debug", skip(self, auth))]
    pub async fn get_access_token(&self, auth: &Auth) -> Result<IssuedToken> {
        match auth {
            Auth::OfficialAccount { appid, secret } => {
                let mut url = self
                    .mp_base
                    .join("cgi-bin/token")
                    .map_err(|e| Error::InvalidUrl(e.to_string()))?;
                url.query_pairs_mut()
                    .append_pair("grant_type", "client_credential")
                    .append_pair("appid", appid)
                    .append_pair("secret", secret);
                if appid.starts_with("ww") {
                    warn!(
                        "appid starts with 'ww' (likely a WeCom corpid); use Auth::WeCom for corp credentials"
                    );
                }
                debug!(appid = %redact_id(appid), "requesting Official Account / Mini Program access_token");
                self.request_token(self.http.get(url)).await
            }
            Auth::WeCom {
                corp_id,
                corp_secret,
            } => {
                let mut url = self
                    .qyapi_base
                    .join("cgi-bin/gettoken")
                    .map_err(|e| Error::InvalidUrl(e.to_string()))?;
                url.query_pairs_mut()
                    .append_pair("corpid", corp_id)
                    .append_pair("corpsecret", corp_secret);
                if corp_id.starts_with("wx") {
                    warn!(
                        "corpid starts with 'wx' (likely an OA/MP appid); use Auth::OfficialAccount instead"
                    );
                }
                debug!(corp_id = %redact_id(corp_id), "requesting WeCom access_token");
                self.request_token(self.http.get(url)).await
            }
        }
    }

    async fn request_token(&self, request: RequestBuilder) -> Result<IssuedToken> {
        let resp = request.send().await?;
        let status = resp.status();
        let bytes = resp.bytes().await?;

        if !status.is_success() {
            return Err(Error::Status {
                status: status.as_u16(),
                body: redact_body(&bytes),
            });
        }

        match serde_json::from_slice::<TokenRawResp>(&bytes) {
            Ok(TokenRawResp::Ok(ok)) => {
                if ok.expires_in <= 0 {
                    return Err(Error::NonPositiveExpiresIn(ok.expires_in));
                }
                Ok(ok)
            }
            Ok(TokenRawResp::Err(err)) if err.errcode != 0 => {
                debug!(
                    errcode = err.errcode,
                    hint = errors::hint_for(err.errcode),
                    "token endpoint returned an error"
                );
                Err(Error::Wx {
                    code: err.errcode,
                    message: err.errmsg,
                })
            }
            Ok(TokenRawResp::Err(_)) => Err(Error::UnexpectedTokenResponse {
                status: status.as_u16(),
                error: "errcode 0 without a token".to_string(),
                body: redact_body(&bytes),
            }),
            Err(de_err) => Err(Error::UnexpectedTokenResponse {
                status: status.as_u16(),
                error: de_err.to_string(),
                body: redact_body(&bytes),
            }),
        }
    }
}

/// Issues `suite_access_token` using the most recent suite ticket.
#[derive(Clone, Debug)]
pub struct SuiteTokenSource {
    client: SuiteClient,
    auth: SuiteAuth,
    ticket: Arc<TicketHolder>,
}

impl SuiteTokenSource {
    pub fn new(client: SuiteClient, auth: SuiteAuth, ticket: Arc<TicketHolder>) -> Self {
        Self {
            client,
            auth,
            ticket,
        }
    }
}

#[async_trait]
impl TokenSource for SuiteTokenSource {
    async fn issue(&self) -> Result<IssuedToken> {
        let ticket = self.ticket.get();
        self.client.get_suite_token(&self.auth, &ticket).await
    }

    fn scope(&self) -> String {
        format!("suite:{}", self.auth.suite_id)
    }
}

/// Issues `access_token` from client credentials.
#[derive(Clone, Debug)]
pub struct AccessTokenSource {
    client: SuiteClient,
    auth: Auth,
}

impl AccessTokenSource {
    pub fn new(client: SuiteClient, auth: Auth) -> Self {
        Self { client, auth }
    }
}

#[async_trait]
impl TokenSource for AccessTokenSource {
    async fn issue(&self) -> Result<IssuedToken> {
        self.client.get_access_token(&self.auth).await
    }

    fn scope(&self) -> String {
        self.auth.scope()
    }
}

/// Redact an ID for logs: keep first 2 and last 2 chars where possible
pub(crate) fn redact_id(id: &str) -> String {
    if id.len() <= 4 || !id.is_ascii() {
        format!("{}***", id.chars().take(2).collect::<String>())
    } else {
        format!("{}***{}", &id[..2], &id[id.len() - 2..])
    }
}

// Redact token fields and truncate so bodies are safe to surface in errors.
fn redact_body(bytes: &[u8]) -> String {
    let mut body = String::from_utf8_lossy(bytes).to_string();
    if let Ok(mut v) = serde_json::from_str::<serde_json::Value>(&body) {
        if let Some(obj) = v.as_object_mut() {
            for field in ["access_token", "suite_access_token"] {
                if obj.contains_key(field) {
                    obj.insert(
                        field.to_string(),
                        serde_json::Value::String("[redacted]".into()),
                    );
                }
            }
        }
        if let Ok(s) = serde_json::to_string(&v) {
            body = s;
        }
    }
    if body.len() > 2048 {
        let mut cut = 2048;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
        body.push_str("...");
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_token_accepts_suite_field_name() {
        let raw: TokenRawResp = serde_json::from_str(
            r#"{"errcode":0,"errmsg":"ok","suite_access_token":"abc","expires_in":7200}"#,
        )
        .unwrap();
        match raw {
            TokenRawResp::Ok(t) => {
                assert_eq!(t.access_token, "abc");
                assert_eq!(t.expires_in, 7200);
            }
            TokenRawResp::Err(_) => panic!("expected success variant"),
        }
    }

    #[test]
    fn error_body_decodes_as_wx_error() {
        let raw: TokenRawResp =
            serde_json::from_str(r#"{"errcode":40085,"errmsg":"invalid suite_ticket"}"#).unwrap();
        assert!(matches!(raw, TokenRawResp::Err(WxError { errcode: 40085, .. })));
    }

    #[test]
    fn redact_body_hides_tokens() {
        let body = redact_body(br#"{"access_token":"secret","expires_in":"x"}"#);
        assert!(!body.contains("secret"));
        assert!(body.contains("[redacted]"));
    }

    #[test]
    fn redact_id_keeps_edges() {
        assert_eq!(redact_id("ww1234567890"), "ww***90");
        assert_eq!(redact_id("abc"), "ab***");
    }

    #[test]
    fn auth_scope_prefixes() {
        let oa = Auth::OfficialAccount {
            appid: "wx1".into(),
            secret: "s".into(),
        };
        let corp = Auth::WeCom {
            corp_id: "ww1".into(),
            corp_secret: "s".into(),
        };
        assert_eq!(oa.scope(), "oa:wx1");
        assert_eq!(corp.scope(), "wecom:ww1");
    }
}
