//! Command line server for the Hashi TCP-over-HTTP relay.

mod metrics;

use std::{net::SocketAddr, time::Duration};

use clap::Parser;
use hashi_relay::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_INBOUND_BYTES, DEFAULT_POLL_TIMEOUT_SECS,
    DEFAULT_SESSION_TIMEOUT_SECS, DEFAULT_SWEEP_INTERVAL_SECS, RelayConfig, SessionStore, server,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Arguments::parse();
    let token = CancellationToken::new();
    tokio::spawn(watch_signals(token.clone()));

    if args.metrics {
        let metrics_handle = metrics::init_metrics();
        let metrics_addr: SocketAddr = ([0, 0, 0, 0], args.metrics_port).into();
        metrics::start_metrics_server(metrics_addr, metrics_handle).await?;
    }

    let config = RelayConfig::default()
        .poll_timeout(Duration::from_secs(args.poll_timeout))
        .session_timeout(Duration::from_secs(args.session_timeout))
        .connect_timeout(Duration::from_secs(args.connect_timeout))
        .sweep_interval(Duration::from_secs(args.sweep_interval))
        .max_inbound_bytes(args.max_inbound_bytes);

    let addr: SocketAddr = args.listen.parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(?config, "starting relay on {addr}");

    server::serve(listener, SessionStore::new(config), token).await?;
    tracing::info!("relay stopped");

    Ok(())
}

/// Cancel `token` on SIGTERM or the first Ctrl+C. A second Ctrl+C exits
/// without waiting for sessions to drain.
async fn watch_signals(token: CancellationToken) {
    tokio::select! {
        () = interrupt() => {
            tracing::info!("interrupted, draining sessions (Ctrl+C again to force)");
        }
        () = terminate() => tracing::info!("terminated, draining sessions"),
    }
    token.cancel();

    interrupt().await;
    tracing::warn!("second interrupt, exiting immediately");
    std::process::exit(130);
}

async fn interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl+C");
        core::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            term.recv().await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "cannot listen for SIGTERM");
            core::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    core::future::pending::<()>().await;
}

#[derive(Debug, Parser)]
#[command(version, about = "TCP-over-HTTP long-poll relay")]
struct Arguments {
    /// Socket address to bind the relay to
    #[arg(short, long, default_value = "0.0.0.0:8023")]
    listen: String,

    /// Seconds a `/read` waits for data before answering 204
    #[arg(long, default_value_t = DEFAULT_POLL_TIMEOUT_SECS)]
    poll_timeout: u64,

    /// Seconds of client inactivity before a session is evicted
    #[arg(long, default_value_t = DEFAULT_SESSION_TIMEOUT_SECS)]
    session_timeout: u64,

    /// Seconds allowed for the outbound TCP connect
    #[arg(long, default_value_t = DEFAULT_CONNECT_TIMEOUT_SECS)]
    connect_timeout: u64,

    /// Seconds between idle-session sweeps
    #[arg(long, default_value_t = DEFAULT_SWEEP_INTERVAL_SECS)]
    sweep_interval: u64,

    /// Unread bytes held per session before it is closed
    #[arg(long, default_value_t = DEFAULT_MAX_INBOUND_BYTES)]
    max_inbound_bytes: usize,

    /// Enable the Prometheus metrics server
    #[arg(long, default_value_t = false)]
    metrics: bool,

    /// Metrics server port (Prometheus endpoint)
    #[arg(long, default_value = "9090")]
    metrics_port: u16,
}
