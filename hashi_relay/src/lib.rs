//! # Hashi Relay
//!
//! Drive an arbitrary outbound TCP connection from a client that can only
//! speak HTTP (for example a sandboxed browser extension).
//!
//! # Protocol
//!
//! ```text
//! ┌──────────┐                 ┌──────────┐                 ┌──────────┐
//! │  Client   │                 │  Relay    │                 │  Target   │
//! └────┬─────┘                 └────┬─────┘                 └────┬─────┘
//!      │ GET /proxy?host=H&port=P   │                            │
//!      │ ─────────────────────────► │  TCP connect (async)       │
//!      │ 200 <session id>           │ ─────────────────────────► │
//!      │ ◄───────────────────────── │                            │
//!      │ GET /write?sid=ID&data=D   │                            │
//!      │ ─────────────────────────► │  buffered until connected, │
//!      │ 200 OK                     │  then written directly     │
//!      │ ◄───────────────────────── │ ─────────────────────────► │
//!      │ GET /read?sid=ID           │                            │
//!      │ ─────────────────────────► │                            │
//!      │       ... (blocks) ...     │ ◄───────────────────────── │
//!      │ 200 <websafe base64>       │                            │
//!      │ ◄───────────────────────── │                            │
//! ```
//!
//! Every payload travels as URL-safe base64 (see [`websafe`]). The session id
//! is the only credential: whoever holds it can read and write the stream.
//!
//! ## Features
//!
//! - `server` — [`axum`] router exposing the relay endpoints
//! - `client` — HTTP client using [`reqwest`]
//! - `metrics` — record session and byte counters via the `metrics` facade

pub mod config;
pub mod error;
pub mod long_poll;
pub mod session;
pub mod store;
pub mod websafe;

#[cfg(feature = "metrics")]
pub mod metrics;

#[cfg(feature = "client")]
pub mod client;

#[cfg(feature = "server")]
pub mod server;

pub use config::RelayConfig;
pub use session::{Session, SessionId, Status};
pub use store::SessionStore;

/// Default long-poll timeout (30 seconds).
///
/// A `/read` that sees no data for this long returns 204 No Content and the
/// client should re-poll.
pub const DEFAULT_POLL_TIMEOUT_SECS: u64 = 30;

/// Default idle session timeout (5 minutes).
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 5 * 60;

/// Default outbound TCP connect timeout (10 seconds).
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default interval between idle-session sweeps (30 seconds).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 30;

/// Default size of a single read from the target connection.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 4096;

/// Default cap on inbound bytes buffered for a client that is not polling
/// (16 MiB). Exceeding it closes the session.
pub const DEFAULT_MAX_INBOUND_BYTES: usize = 16 * 1024 * 1024;
