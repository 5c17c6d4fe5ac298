//! HTTP request handlers for the relay.

use std::sync::Arc;

use axum::{
    Router,
    extract::{Query, State},
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use serde::Deserialize;
use tracing::{debug, warn};

use super::cors::permissive_cors;
use crate::{
    error::{ServerError, SessionError},
    session::{Session, SessionId},
    store::SessionStore,
    websafe,
};

#[derive(Debug, Deserialize)]
struct ProxyParams {
    host: String,
    port: String,
}

#[derive(Debug, Deserialize)]
struct SessionParams {
    sid: String,
}

#[derive(Debug, Deserialize)]
struct WriteParams {
    sid: String,
    data: String,
}

/// Create the Axum router for the relay endpoints.
pub fn router(store: SessionStore) -> Router {
    Router::new()
        .route("/proxy", get(handle_proxy))
        .route("/read", get(handle_read))
        .route("/write", get(handle_write))
        .route("/close", get(handle_close))
        .layer(middleware::from_fn(permissive_cors))
        .with_state(store)
}

/// Handle `GET /proxy`: open a session and start connecting.
async fn handle_proxy(
    State(store): State<SessionStore>,
    Query(params): Query<ProxyParams>,
) -> Result<String, ServerError> {
    let host = params.host.trim();
    if host.is_empty() {
        return Err(ServerError::InvalidTarget("empty host".into()));
    }

    let port = match params.port.trim().parse::<u16>() {
        Ok(port) if port != 0 => port,
        _ => {
            warn!(port = %params.port, "rejected proxy request with bad port");
            return Err(ServerError::InvalidTarget(format!(
                "bad port {:?}",
                params.port
            )));
        }
    };

    let session_id = store.create(host, port).await;
    Ok(session_id.to_hex())
}

/// Handle `GET /read`: long-poll for inbound bytes.
async fn handle_read(
    State(store): State<SessionStore>,
    Query(params): Query<SessionParams>,
) -> Result<Response, ServerError> {
    let session = lookup(&store, &params.sid).await?;
    debug!(session_id = %session.id(), "GET /read waiting...");

    match session.read(store.config().poll_timeout).await? {
        Some(data) => {
            debug!(session_id = %session.id(), len = data.len(), "GET /read delivering");
            Ok((
                [(header::CONTENT_TYPE, "text/plain")],
                websafe::encode(&data),
            )
                .into_response())
        }
        None => {
            debug!(session_id = %session.id(), "GET /read poll timeout");
            Ok(StatusCode::NO_CONTENT.into_response())
        }
    }
}

/// Handle `GET /write`: push bytes toward the target.
async fn handle_write(
    State(store): State<SessionStore>,
    Query(params): Query<WriteParams>,
) -> Result<&'static str, ServerError> {
    let session = lookup(&store, &params.sid).await?;

    let status = session.status().await;
    if !status.is_usable() {
        return Err(SessionError::Unusable { status }.into());
    }

    let data = websafe::decode(&params.data).inspect_err(|e| {
        warn!(session_id = %session.id(), error = %e, "rejected write payload");
    })?;

    debug!(session_id = %session.id(), len = data.len(), "GET /write");
    session.write(Bytes::from(data)).await?;
    Ok("OK")
}

/// Handle `GET /close`: explicit teardown. Unknown ids are not an error.
async fn handle_close(
    State(store): State<SessionStore>,
    Query(params): Query<SessionParams>,
) -> &'static str {
    if let Some(session_id) = SessionId::from_hex(&params.sid) {
        store.remove(&session_id).await;
    }
    "OK"
}

async fn lookup(store: &SessionStore, sid: &str) -> Result<Arc<Session>, ServerError> {
    let session_id = SessionId::from_hex(sid).ok_or(ServerError::SessionNotFound)?;
    store
        .get(&session_id)
        .await
        .ok_or(ServerError::SessionNotFound)
}
