#![doc = r#"
wxsuite-rs

Token refresh and encrypted callback verification for WeCom third-party suites
and WeChat official accounts.

Two halves:
- outbound: a [`TokenRefresher`] keeps a [`CredentialStore`] populated with a
  `suite_access_token` (driven by the pushed suite ticket) or an `access_token`;
- inbound: a [`CallbackVerifier`] checks signatures, decrypts pushes with the
  current or previous EncodingAESKey, checks the receiver id and dispatches.

Quick usage:

```ignore
use std::sync::Arc;
use wxsuite_rs::{
    CallbackVerifier, Dispatcher, KeyRing, SuiteConfig, SuiteTicketHandler, SuiteTokenService,
    TokenService, INFO_TYPE_SUITE_TICKET,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = SuiteConfig::from_env()?;
    let service = Arc::new(SuiteTokenService::new(
        cfg.suite_client()?,
        cfg.suite_auth(),
        cfg.refresher_options(),
    ));

    let dispatcher = Dispatcher::new().on(
        INFO_TYPE_SUITE_TICKET,
        Arc::new(SuiteTicketHandler::new(service.clone())),
    );
    let verifier = Arc::new(CallbackVerifier::new(
        &cfg.callback_token,
        &cfg.suite_id,
        Arc::new(cfg.key_ring()),
        dispatcher,
    ));

    let app = wxsuite_rs::server::router(verifier, "/callback");
    let listener = tokio::net::TcpListener::bind(cfg.listen_addr).await?;
    axum::serve(listener, app).await?;

    // elsewhere: let token = service.token().await?;
    Ok(())
}
```
"#]

pub mod callback;
pub mod config;
pub mod credential;
pub mod credential_redis;
pub mod crypto;
pub mod envelope;
pub mod errors;
pub mod keys;
pub mod refresher;
pub mod server;
pub mod service;
pub mod ticket;
pub mod token;

pub use callback::{
    CallbackQuery, CallbackVerifier, Dispatcher, InvalidRequestHandler, MessageContext,
    MessageHandler, Reply, VerifyError,
};
pub use config::{ConfigError, SuiteConfig};
pub use credential::{Credential, CredentialError, CredentialStore, MemoryCredentialStore};
pub use credential_redis::RedisCredentialStore;
pub use envelope::Envelope;
pub use keys::{AesKey, KeyPair, KeyRing};
pub use refresher::{RefresherOptions, SchedulerState, TokenRefresher, refresh_interval};
pub use service::{
    AccessTokenService, INFO_TYPE_SUITE_TICKET, SuiteTicketHandler, SuiteTokenService,
    TokenService,
};
pub use ticket::TicketHolder;
pub use token::*;
