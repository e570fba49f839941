//! Environment configuration.
//!
//! Required:
//! - `WXSUITE_SUITE_ID`, `WXSUITE_SUITE_SECRET`
//! - `WXSUITE_CALLBACK_TOKEN`, `WXSUITE_ENCODING_AES_KEY`
//!
//! Optional:
//! - `WXSUITE_LAST_ENCODING_AES_KEY`: key in use before the last rotation
//! - `WXSUITE_HTTP_TIMEOUT_SECS` (default 10)
//! - `WXSUITE_RETRY_INTERVAL_SECS` (default 60)
//! - `WXSUITE_LISTEN_ADDR` (default `127.0.0.1:3000`)
//!
//! Call `dotenvy::dotenv()` first to pick up a `.env` file.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use thiserror::Error;

use crate::keys::{AesKey, KeyError, KeyRing};
use crate::refresher::{DEFAULT_RETRY_INTERVAL, RefresherOptions};
use crate::token::{self, DEFAULT_HTTP_TIMEOUT, SuiteAuth, SuiteClient};

const DEFAULT_LISTEN_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 3000);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing environment variable {0}")]
    Missing(&'static str),

    #[error("invalid {var}: {source}")]
    InvalidKey {
        var: &'static str,
        #[source]
        source: KeyError,
    },

    #[error("invalid {var}: {reason}")]
    Invalid { var: &'static str, reason: String },

    #[error("failed to build http client: {0}")]
    Http(#[from] token::Error),
}

/// Startup configuration for one suite.
#[derive(Clone)]
pub struct SuiteConfig {
    pub suite_id: String,
    pub suite_secret: String,
    pub callback_token: String,
    pub aes_key: AesKey,
    /// Zero when no previous key is configured
    pub last_aes_key: AesKey,
    pub http_timeout: Duration,
    pub retry_interval: Duration,
    pub listen_addr: SocketAddr,
}

impl fmt::Debug for SuiteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteConfig")
            .field("suite_id", &token::redact_id(&self.suite_id))
            .field("http_timeout", &self.http_timeout)
            .field("retry_interval", &self.retry_interval)
            .field("listen_addr", &self.listen_addr)
            .finish_non_exhaustive()
    }
}

impl SuiteConfig {
    /// Read from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Read through `lookup`; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |name: &'static str| get(name).ok_or(ConfigError::Missing(name));

        let aes_key = parse_key("WXSUITE_ENCODING_AES_KEY", &require("WXSUITE_ENCODING_AES_KEY")?)?;
        let last_aes_key = match get("WXSUITE_LAST_ENCODING_AES_KEY") {
            Some(raw) => parse_key("WXSUITE_LAST_ENCODING_AES_KEY", &raw)?,
            None => AesKey::ZERO,
        };

        let listen_addr = match get("WXSUITE_LISTEN_ADDR") {
            Some(raw) => raw.parse().map_err(|e: std::net::AddrParseError| ConfigError::Invalid {
                var: "WXSUITE_LISTEN_ADDR",
                reason: e.to_string(),
            })?,
            None => DEFAULT_LISTEN_ADDR,
        };

        Ok(Self {
            suite_id: require("WXSUITE_SUITE_ID")?,
            suite_secret: require("WXSUITE_SUITE_SECRET")?,
            callback_token: require("WXSUITE_CALLBACK_TOKEN")?,
            aes_key,
            last_aes_key,
            http_timeout: parse_secs(get("WXSUITE_HTTP_TIMEOUT_SECS"), "WXSUITE_HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT)?,
            retry_interval: parse_secs(get("WXSUITE_RETRY_INTERVAL_SECS"), "WXSUITE_RETRY_INTERVAL_SECS", DEFAULT_RETRY_INTERVAL)?,
            listen_addr,
        })
    }

    pub fn with_http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = timeout;
        self
    }

    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn suite_auth(&self) -> SuiteAuth {
        SuiteAuth {
            suite_id: self.suite_id.clone(),
            suite_secret: self.suite_secret.clone(),
        }
    }

    /// Current key plus the pre-rotation key, if configured.
    pub fn key_ring(&self) -> KeyRing {
        KeyRing::with_previous(self.aes_key, self.last_aes_key)
    }

    pub fn refresher_options(&self) -> RefresherOptions {
        RefresherOptions {
            retry_interval: self.retry_interval,
            ..RefresherOptions::default()
        }
    }

    pub fn suite_client(&self) -> Result<SuiteClient, ConfigError> {
        Ok(SuiteClient::new(self.http_timeout)?)
    }
}

fn parse_key(var: &'static str, raw: &str) -> Result<AesKey, ConfigError> {
    AesKey::from_encoding_aes_key(raw).map_err(|source| ConfigError::InvalidKey { var, source })
}

fn parse_secs(
    raw: Option<String>,
    var: &'static str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let Some(raw) = raw else { return Ok(default) };
    match raw.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        Ok(_) => Err(ConfigError::Invalid {
            var,
            reason: "must be positive".into(),
        }),
        Err(e) => Err(ConfigError::Invalid {
            var,
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const KEY: &str = "abcdefghijklmnopqrstuvwxyz0123456789ABCDEFG";

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    fn required() -> Vec<(&'static str, &'static str)> {
        vec![
            ("WXSUITE_SUITE_ID", "wwsuite0001"),
            ("WXSUITE_SUITE_SECRET", "secret"),
            ("WXSUITE_CALLBACK_TOKEN", "QDG6eK"),
            ("WXSUITE_ENCODING_AES_KEY", KEY),
        ]
    }

    #[test]
    fn defaults_apply() {
        let cfg = SuiteConfig::from_lookup(env(&required())).unwrap();
        assert_eq!(cfg.http_timeout, Duration::from_secs(10));
        assert_eq!(cfg.retry_interval, Duration::from_secs(60));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
        assert!(cfg.last_aes_key.is_zero());
        assert_eq!(
            cfg.key_ring().current_key(),
            AesKey::from_encoding_aes_key(KEY).unwrap()
        );
    }

    #[test]
    fn missing_variable_is_reported() {
        let mut pairs = required();
        pairs.retain(|(k, _)| *k != "WXSUITE_SUITE_SECRET");
        assert!(matches!(
            SuiteConfig::from_lookup(env(&pairs)),
            Err(ConfigError::Missing("WXSUITE_SUITE_SECRET"))
        ));
    }

    #[test]
    fn bad_keys_abort_startup() {
        let mut pairs = required();
        pairs.push(("WXSUITE_LAST_ENCODING_AES_KEY", "too-short"));
        assert!(matches!(
            SuiteConfig::from_lookup(env(&pairs)),
            Err(ConfigError::InvalidKey {
                var: "WXSUITE_LAST_ENCODING_AES_KEY",
                ..
            })
        ));
    }

    #[test]
    fn overrides_are_parsed() {
        let mut pairs = required();
        pairs.push(("WXSUITE_RETRY_INTERVAL_SECS", "5"));
        pairs.push(("WXSUITE_LISTEN_ADDR", "0.0.0.0:8080"));
        pairs.push(("WXSUITE_HTTP_TIMEOUT_SECS", "0"));
        assert!(matches!(
            SuiteConfig::from_lookup(env(&pairs)),
            Err(ConfigError::Invalid {
                var: "WXSUITE_HTTP_TIMEOUT_SECS",
                ..
            })
        ));

        pairs.pop();
        let cfg = SuiteConfig::from_lookup(env(&pairs)).unwrap();
        assert_eq!(cfg.refresher_options().retry_interval, Duration::from_secs(5));
        assert_eq!(cfg.listen_addr.port(), 8080);
    }
}
