//! Prometheus metrics endpoint.

use std::net::SocketAddr;

use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;

/// Install the global recorder and return a handle for rendering.
///
/// # Panics
///
/// Panics if a recorder is already installed.
#[must_use]
pub(crate) fn init_metrics() -> PrometheusHandle {
    #[allow(clippy::expect_used)]
    PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Serve `/metrics` on `addr` from a background task.
///
/// # Errors
///
/// Returns an error if the address cannot be bound.
pub(crate) async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> anyhow::Result<()> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let listener = TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on {}", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}
