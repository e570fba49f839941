//! Credential model and stores.
//!
//! A [`Credential`] is either an issued value or an error, never both, and is
//! always replaced wholesale. Stores hold exactly one credential per scope,
//! written by the refresher and read by any number of API callers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::errors;
use crate::token;

/// Error recorded in a credential store. Cheap to clone to many readers.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum CredentialError {
    #[error("suite ticket not yet configured")]
    TicketNotConfigured,

    #[error("credential not initialized")]
    NotInitialized,

    #[error("weixin error {code}: {message}")]
    Provider { code: i64, message: String },

    #[error("credential fetch failed: {0}")]
    Fetch(String),

    #[error("credential store error: {0}")]
    Store(String),
}

impl CredentialError {
    /// Whether a forced refresh is the expected fix.
    pub fn should_refresh_token(&self) -> bool {
        match self {
            CredentialError::Provider { code, .. } => errors::should_refresh_token(*code),
            _ => false,
        }
    }
}

impl From<&token::Error> for CredentialError {
    fn from(err: &token::Error) -> Self {
        match err {
            token::Error::Wx { code, message } => CredentialError::Provider {
                code: *code,
                message: message.clone(),
            },
            token::Error::TicketNotConfigured => CredentialError::TicketNotConfigured,
            other => CredentialError::Fetch(other.to_string()),
        }
    }
}

impl From<token::Error> for CredentialError {
    fn from(err: token::Error) -> Self {
        CredentialError::from(&err)
    }
}

/// One published refresh outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    value: String,
    error: Option<CredentialError>,
    refresh_in: Duration,
}

impl Credential {
    /// A successfully issued value, to be refreshed after `refresh_in`.
    pub fn issued(value: impl Into<String>, refresh_in: Duration) -> Self {
        Self {
            value: value.into(),
            error: None,
            refresh_in,
        }
    }

    /// A failed refresh; the value is cleared.
    pub fn failed(error: CredentialError, refresh_in: Duration) -> Self {
        Self {
            value: String::new(),
            error: Some(error),
            refresh_in,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn error(&self) -> Option<&CredentialError> {
        self.error.as_ref()
    }

    pub fn refresh_in(&self) -> Duration {
        self.refresh_in
    }

    /// Collapse into what API callers consume.
    pub fn to_result(&self) -> Result<String, CredentialError> {
        match &self.error {
            Some(err) => Err(err.clone()),
            None => Ok(self.value.clone()),
        }
    }
}

/// Holder of the current credential for one scope.
///
/// Reads never block on network activity; the single writer is the refresher.
/// Alternative backends (see [`crate::credential_redis`]) share credentials
/// across processes.
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    /// The last published value, or the error of the last refresh.
    async fn get(&self) -> Result<String, CredentialError>;

    /// Atomically replace the stored credential.
    async fn set(&self, credential: Credential) -> Result<(), CredentialError>;
}

/// In-process store: one `Arc<Credential>` swapped under a read-write lock.
#[derive(Debug)]
pub struct MemoryCredentialStore {
    current: RwLock<Arc<Credential>>,
}

impl Default for MemoryCredentialStore {
    fn default() -> Self {
        Self::new(CredentialError::NotInitialized)
    }
}

impl MemoryCredentialStore {
    /// Create a store that reports `initial` until the first refresh publishes.
    pub fn new(initial: CredentialError) -> Self {
        Self {
            current: RwLock::new(Arc::new(Credential::failed(initial, Duration::ZERO))),
        }
    }

    /// Snapshot of the whole credential.
    pub fn load(&self) -> Arc<Credential> {
        Arc::clone(&self.current.read())
    }

    pub fn store(&self, credential: Credential) {
        let next = Arc::new(credential);
        *self.current.write() = next;
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn get(&self) -> Result<String, CredentialError> {
        self.load().to_result()
    }

    async fn set(&self, credential: Credential) -> Result<(), CredentialError> {
        self.store(credential);
        Ok(())
    }
}
