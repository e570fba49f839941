//! Redis-backed credential store.
//!
//! Lets several processes share the credentials published by one refresher.
//! Each scope maps to one key holding the JSON-encoded [`Credential`], written
//! with a TTL slightly longer than the refresh interval so an abandoned value
//! expires on its own.
//!
//! Example usage:
//! ```ignore
//! use std::sync::Arc;
//! use redis::aio::ConnectionManager;
//! use wxsuite_rs::credential_redis::RedisCredentialStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = redis::Client::open("redis://127.0.0.1/")?;
//!     let redis = ConnectionManager::new(client).await?;
//!     let store = RedisCredentialStore::new(redis, "suite:wwsuite").with_namespace("wxsuite:credential");
//!     let store: Arc<dyn wxsuite_rs::CredentialStore> = Arc::new(store);
//!     Ok(())
//! }
//! ```

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{debug, instrument};

use crate::credential::{Credential, CredentialError, CredentialStore};

const DEFAULT_NAMESPACE: &str = "wxsuite:credential";

/// Credential store backed by a Redis key per scope
#[derive(Clone)]
pub struct RedisCredentialStore {
    /// Redis connection manager (async)
    redis: ConnectionManager,
    /// Namespacing for keys, e.g. "wxsuite:credential"
    namespace: String,
    /// Identity the credential belongs to, e.g. "suite:wwxxxx"
    scope: String,
    /// Extra lifetime on top of the refresh interval (default: 120s)
    ttl_margin_secs: u64,
}

impl RedisCredentialStore {
    pub fn new(redis: ConnectionManager, scope: impl Into<String>) -> Self {
        Self {
            redis,
            namespace: DEFAULT_NAMESPACE.to_string(),
            scope: scope.into(),
            ttl_margin_secs: 120,
        }
    }

    /// Override the Redis key namespace
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Override the TTL margin added to each refresh interval
    pub fn with_ttl_margin(mut self, secs: u64) -> Self {
        self.ttl_margin_secs = secs;
        self
    }

    /// The Redis key this store reads and writes.
    pub fn key(&self) -> String {
        format!("{}:{}", self.namespace, self.scope)
    }

    /// Explicitly drop the shared credential
    pub async fn invalidate(&self) -> Result<(), CredentialError> {
        let mut conn = self.redis.clone();
        let _: () = conn.del(self.key()).await.map_err(store_error)?;
        Ok(())
    }
}

#[async_trait]
impl CredentialStore for RedisCredentialStore {
    #[instrument(level = "debug", skip(self), fields(scope = %self.scope))]
    async fn get(&self) -> Result<String, CredentialError> {
        let mut conn = self.redis.clone();
        let raw: Option<String> = conn.get(self.key()).await.map_err(store_error)?;
        match raw {
            Some(s) => {
                let credential: Credential = serde_json::from_str(&s)
                    .map_err(|e| CredentialError::Store(e.to_string()))?;
                credential.to_result()
            }
            None => {
                debug!("no shared credential yet");
                Err(CredentialError::NotInitialized)
            }
        }
    }

    #[instrument(level = "debug", skip(self, credential), fields(scope = %self.scope))]
    async fn set(&self, credential: Credential) -> Result<(), CredentialError> {
        let ttl = compute_ttl(credential.refresh_in(), self.ttl_margin_secs);
        let json =
            serde_json::to_string(&credential).map_err(|e| CredentialError::Store(e.to_string()))?;
        let mut conn = self.redis.clone();
        let _: () = redis::cmd("SET")
            .arg(self.key())
            .arg(json)
            .arg("EX")
            .arg(ttl)
            .query_async(&mut conn)
            .await
            .map_err(store_error)?;
        debug!(ttl, "shared credential updated");
        Ok(())
    }
}

/// Refresh interval plus margin, never below one minute
fn compute_ttl(refresh_in: Duration, margin_secs: u64) -> u64 {
    let min_ttl = 60;
    (refresh_in.as_secs() + margin_secs).max(min_ttl)
}

fn store_error(e: redis::RedisError) -> CredentialError {
    CredentialError::Store(e.to_string())
}
