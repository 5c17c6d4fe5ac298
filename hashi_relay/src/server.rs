//! HTTP surface of the relay.
//!
//! | Endpoint                   | Purpose                                   |
//! |----------------------------|-------------------------------------------|
//! | `GET /proxy?host=&port=`   | Open a session, start connecting          |
//! | `GET /write?sid=&data=`    | Push URL-safe base64 bytes to the target  |
//! | `GET /read?sid=`           | Long-poll for bytes from the target       |
//! | `GET /close?sid=`          | Tear the session down                     |
//!
//! Everything is `GET` so the endpoints can be driven from a plain `<img>` or
//! `XMLHttpRequest` in a locked-down client.

mod cors;
mod handlers;

pub use cors::permissive_cors;
pub use handlers::router;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{ServerError, SessionError},
    store::SessionStore,
};

impl ServerError {
    /// HTTP status this error is reported with.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::SessionNotFound | Self::Session(SessionError::Unusable { .. }) => {
                StatusCode::GONE
            }
            Self::Session(SessionError::ReaderBusy) => StatusCode::CONFLICT,
            Self::InvalidTarget(_) | Self::MalformedEncoding(_) => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        (self.status_code(), self.to_string()).into_response()
    }
}

/// Serve the relay on `listener` until `token` is cancelled.
///
/// Also runs the idle-session sweeper. On shutdown every session is closed,
/// which releases any long-poll still waiting.
///
/// # Errors
///
/// Returns an error if the underlying HTTP server fails.
pub async fn serve(
    listener: TcpListener,
    store: SessionStore,
    token: CancellationToken,
) -> std::io::Result<()> {
    let expiry = {
        let store = store.clone();
        let token = token.clone();
        tokio::spawn(async move { store.run_expiry(token).await })
    };

    if let Ok(addr) = listener.local_addr() {
        tracing::info!("relay listening on {addr}");
    }

    let shutdown_store = store.clone();
    let result = axum::serve(listener, router(store))
        .with_graceful_shutdown(async move {
            token.cancelled().await;
            shutdown_store.close_all().await;
        })
        .await;

    if let Err(e) = expiry.await {
        tracing::warn!("session expiry task failed: {e}");
    }

    result
}
