//! axum adapter for [`CallbackVerifier`].
//!
//! - GET  `{path}`: URL verification, answers with the decrypted echo
//! - POST `{path}`: message push, answers with the dispatcher's reply
//!
//! Rejections answer `400 Bad Request` with an empty body.

use std::sync::Arc;

use axum::{
    Router,
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::callback::{CallbackQuery, CallbackVerifier};

/// Build a router serving the callback endpoint at `path`.
pub fn router(verifier: Arc<CallbackVerifier>, path: &str) -> Router {
    Router::new()
        .route(path, get(verify_url).post(receive_push))
        .with_state(verifier)
}

async fn verify_url(
    State(verifier): State<Arc<CallbackVerifier>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    match verifier.verify_url(&query) {
        Ok(echo) => (StatusCode::OK, echo).into_response(),
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}

async fn receive_push(
    State(verifier): State<Arc<CallbackVerifier>>,
    Query(query): Query<CallbackQuery>,
    body: Bytes,
) -> Response {
    match verifier.handle_push(&query, &body).await {
        Ok(reply) => (StatusCode::OK, reply.into_bytes()).into_response(),
        Err(_) => StatusCode::BAD_REQUEST.into_response(),
    }
}
