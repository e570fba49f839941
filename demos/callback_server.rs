//! Example: third-party suite callback server
//!
//! This example:
//! 1. Loads suite configuration from the environment (and `.env`)
//! 2. Starts the suite token service, which waits for the first suite_ticket push
//! 3. Verifies, decrypts and dispatches callbacks
//! 4. Answers text messages with an encrypted passive reply
//!
//! Running this example:
//! ```bash
//! WXSUITE_SUITE_ID=ww... \
//! WXSUITE_SUITE_SECRET=... \
//! WXSUITE_CALLBACK_TOKEN=your_callback_token \
//! WXSUITE_ENCODING_AES_KEY=your_43_char_aes_key \
//! RUST_LOG=info,wxsuite_rs=debug \
//! cargo run --example callback_server
//! ```
//!
//! Endpoints (default http://127.0.0.1:3000):
//! - GET  /health   - Health check endpoint
//! - GET  /callback - URL verification
//! - POST /callback - suite events and app messages

use std::sync::Arc;

use async_trait::async_trait;
use axum::{Json, response::IntoResponse, routing::get};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use wxsuite_rs::{
    CallbackVerifier, Dispatcher, INFO_TYPE_SUITE_TICKET, MessageContext, MessageHandler, Reply,
    SuiteConfig, SuiteTicketHandler, SuiteTokenService, TokenService, crypto, keys,
};

/// Echo text messages back, encrypted with the key that opened them.
struct EchoText {
    token: String,
}

#[async_trait]
impl MessageHandler for EchoText {
    async fn handle(&self, ctx: &MessageContext) -> anyhow::Result<Reply> {
        let reply = format!(
            "<xml><ToUserName><![CDATA[{}]]></ToUserName><FromUserName><![CDATA[{}]]></FromUserName><CreateTime>{}</CreateTime><MsgType><![CDATA[text]]></MsgType><Content><![CDATA[received]]></Content></xml>",
            ctx.envelope.from_user_name, ctx.envelope.to_user_name, ctx.timestamp
        );
        let body = crypto::encrypt_reply(
            &self.token,
            &ctx.aes_key,
            &ctx.receiver_id,
            reply.as_bytes(),
            &ctx.timestamp,
            &ctx.nonce,
        )?;
        Ok(Reply::Body(body.into_bytes()))
    }
}

/// Health check endpoint
async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "message": "suite callback server is running"
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = match SuiteConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            warn!("{e}");
            info!(
                "example values: WXSUITE_CALLBACK_TOKEN={} WXSUITE_ENCODING_AES_KEY={}",
                keys::generate_token(32),
                keys::generate_encoding_aes_key()
            );
            return Err(e.into());
        }
    };
    info!(?cfg, "configuration loaded");

    let service = Arc::new(SuiteTokenService::new(
        cfg.suite_client()?,
        cfg.suite_auth(),
        cfg.refresher_options(),
    ));

    let dispatcher = Dispatcher::new()
        .on(
            INFO_TYPE_SUITE_TICKET,
            Arc::new(SuiteTicketHandler::new(Arc::clone(&service))),
        )
        .on(
            "text",
            Arc::new(EchoText {
                token: cfg.callback_token.clone(),
            }),
        );
    let verifier = Arc::new(CallbackVerifier::new(
        &cfg.callback_token,
        &cfg.suite_id,
        Arc::new(cfg.key_ring()),
        dispatcher,
    ));

    let app = wxsuite_rs::server::router(verifier, "/callback").route("/health", get(health));

    let listener = tokio::net::TcpListener::bind(cfg.listen_addr).await?;
    info!("Server listening on http://{}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    match service.token().await {
        Ok(_) => info!("suite_access_token was available at shutdown"),
        Err(e) => info!("no suite_access_token at shutdown: {e}"),
    }
    service.shutdown().await;
    Ok(())
}
