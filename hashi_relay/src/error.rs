//! Error types for the relay.

use thiserror::Error;

use crate::session::Status;

/// A payload was not valid URL-safe base64.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Malformed URL-safe base64: {0}")]
pub struct MalformedEncoding(#[from] base64::DecodeError);

/// Problem while reading from or writing to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The session is closed or its connect failed.
    #[error("Session gone ({status})")]
    Unusable {
        /// The terminal status the session was in.
        status: Status,
    },

    /// Another long-poll read is already waiting on this session.
    #[error("A read is already pending on this session")]
    ReaderBusy,
}

/// Problems surfaced by the HTTP handlers.
#[cfg(feature = "server")]
#[derive(Debug, Error)]
pub enum ServerError {
    /// Session id unknown, malformed, or expired.
    #[error("Session not found")]
    SessionNotFound,

    /// The `/proxy` target could not be parsed.
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// The `/write` payload could not be decoded.
    #[error(transparent)]
    MalformedEncoding(#[from] MalformedEncoding),

    /// The session refused the operation.
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Problems seen by the HTTP client.
#[cfg(feature = "client")]
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Invalid URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// The relay reported the session as gone (410).
    #[error("Session gone")]
    Gone,

    /// The relay rejected a second concurrent read (409).
    #[error("A read is already pending on this session")]
    ReaderBusy,

    /// The relay returned a payload that is not URL-safe base64.
    #[error(transparent)]
    MalformedEncoding(#[from] MalformedEncoding),

    /// The relay returned an unexpected status.
    #[error("Server error: {status} - {message}")]
    ServerError {
        /// HTTP status code.
        status: u16,
        /// Body returned by the relay.
        message: String,
    },
}
