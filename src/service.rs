//! Token services: the capability outbound API wrappers depend on.
//!
//! - [`SuiteTokenService`]: `suite_access_token`, driven by the pushed suite ticket.
//!   Nothing touches the network until the first non-empty ticket arrives.
//! - [`AccessTokenService`]: corp / official-account `access_token` from client credentials.
//!
//! Typical caller pattern for provider errors on unrelated endpoints:
//!
//! ```ignore
//! let resp = call_api(&svc.token().await?).await?;
//! if wxsuite_rs::errors::should_refresh_token(resp.errcode) {
//!     let fresh = svc.refresh_token().await?;
//!     call_api(&fresh).await?;
//! }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::callback::{MessageContext, MessageHandler, Reply};
use crate::credential::{CredentialError, CredentialStore, MemoryCredentialStore};
use crate::refresher::{RefresherOptions, TokenRefresher};
use crate::ticket::TicketHolder;
use crate::token::{AccessTokenSource, Auth, SuiteAuth, SuiteClient, SuiteTokenSource, TokenSource, redact_id};

/// InfoType of the suite ticket push.
pub const INFO_TYPE_SUITE_TICKET: &str = "suite_ticket";

/// Read and force-refresh one credential.
#[async_trait]
pub trait TokenService: Send + Sync + 'static {
    /// The cached credential, without a network call.
    async fn token(&self) -> Result<String, CredentialError>;

    /// Issue a new credential now and realign the background schedule.
    async fn refresh_token(&self) -> Result<String, CredentialError>;
}

/// `suite_access_token` service fed by [`SuiteTicketHandler`].
pub struct SuiteTokenService {
    ticket: Arc<TicketHolder>,
    refresher: TokenRefresher,
}

impl SuiteTokenService {
    pub fn new(client: SuiteClient, auth: SuiteAuth, options: RefresherOptions) -> Self {
        let ticket = Arc::new(TicketHolder::new());
        let source = SuiteTokenSource::new(client, auth, Arc::clone(&ticket));
        Self::with_source(
            ticket,
            Arc::new(source),
            Arc::new(MemoryCredentialStore::new(CredentialError::TicketNotConfigured)),
            options,
        )
    }

    /// Assemble from parts, e.g. a Redis store or a test source.
    pub fn with_source(
        ticket: Arc<TicketHolder>,
        source: Arc<dyn TokenSource>,
        store: Arc<dyn CredentialStore>,
        options: RefresherOptions,
    ) -> Self {
        Self {
            ticket,
            refresher: TokenRefresher::new(source, store, options),
        }
    }

    /// Record a pushed ticket. The first non-empty ticket starts the refresher
    /// (one immediate issuance, then the background schedule); later tickets are
    /// only stored for the next issuance.
    ///
    /// Returns `true` when this call started the refresher.
    pub async fn set_ticket(&self, ticket: &str) -> bool {
        if self.ticket.set_if_non_empty(ticket) {
            self.refresher.start().await
        } else {
            false
        }
    }

    /// Like [`set_ticket`](Self::set_ticket), but the first issuance runs in
    /// the background task instead of on the caller.
    ///
    /// Must be called from within a tokio runtime.
    pub fn accept_ticket(&self, ticket: &str) -> bool {
        self.ticket.set_if_non_empty(ticket) && self.refresher.spawn()
    }

    pub fn ticket(&self) -> &Arc<TicketHolder> {
        &self.ticket
    }

    pub fn refresher(&self) -> &TokenRefresher {
        &self.refresher
    }

    pub async fn shutdown(&self) {
        self.refresher.shutdown().await;
    }
}

#[async_trait]
impl TokenService for SuiteTokenService {
    async fn token(&self) -> Result<String, CredentialError> {
        if !self.ticket.is_set() {
            return Err(CredentialError::TicketNotConfigured);
        }
        self.refresher.store().get().await
    }

    async fn refresh_token(&self) -> Result<String, CredentialError> {
        if !self.ticket.is_set() {
            return Err(CredentialError::TicketNotConfigured);
        }
        self.refresher.refresh_now().await
    }
}

/// `access_token` service for corp or official-account apps.
pub struct AccessTokenService {
    refresher: TokenRefresher,
}

impl AccessTokenService {
    pub fn new(client: SuiteClient, auth: Auth, options: RefresherOptions) -> Self {
        Self::with_source(
            Arc::new(AccessTokenSource::new(client, auth)),
            Arc::new(MemoryCredentialStore::default()),
            options,
        )
    }

    pub fn with_source(
        source: Arc<dyn TokenSource>,
        store: Arc<dyn CredentialStore>,
        options: RefresherOptions,
    ) -> Self {
        Self {
            refresher: TokenRefresher::new(source, store, options),
        }
    }

    /// Issue the first token and start the background schedule.
    pub async fn start(&self) -> bool {
        self.refresher.start().await
    }

    pub fn refresher(&self) -> &TokenRefresher {
        &self.refresher
    }

    pub async fn shutdown(&self) {
        self.refresher.shutdown().await;
    }
}

#[async_trait]
impl TokenService for AccessTokenService {
    async fn token(&self) -> Result<String, CredentialError> {
        self.refresher.store().get().await
    }

    async fn refresh_token(&self) -> Result<String, CredentialError> {
        self.refresher.refresh_now().await
    }
}

/// Feeds `InfoType=suite_ticket` pushes into a [`SuiteTokenService`].
pub struct SuiteTicketHandler {
    service: Arc<SuiteTokenService>,
}

impl SuiteTicketHandler {
    pub fn new(service: Arc<SuiteTokenService>) -> Self {
        Self { service }
    }
}

#[async_trait]
impl MessageHandler for SuiteTicketHandler {
    async fn handle(&self, ctx: &MessageContext) -> anyhow::Result<Reply> {
        let ticket = ctx.envelope.suite_ticket.trim();
        anyhow::ensure!(!ticket.is_empty(), "suite_ticket push without SuiteTicket");

        // Acknowledge now; the refresher issues the first token on its own task.
        if self.service.accept_ticket(ticket) {
            info!(suite_id = %redact_id(&ctx.envelope.suite_id), "first suite ticket received; refresher started");
        } else if !self.service.refresher().is_started() {
            warn!("suite ticket stored but refresher is not running");
        }
        Ok(Reply::Success)
    }
}
