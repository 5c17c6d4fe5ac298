//! Prometheus-style instrumentation for the relay.
//!
//! This module is only available when the `metrics` feature is enabled.
//! Installing a recorder is left to the binary.

/// Metric names used throughout the relay.
pub mod names {
    /// Number of sessions currently registered.
    pub const SESSIONS_ACTIVE: &str = "hashi_relay_sessions_active";
    /// Total sessions opened.
    pub const SESSIONS_OPENED: &str = "hashi_relay_sessions_opened_total";
    /// Total sessions removed (closed, torn down, or expired).
    pub const SESSIONS_REMOVED: &str = "hashi_relay_sessions_removed_total";
    /// Total outbound connects that failed or timed out.
    pub const CONNECT_FAILURES: &str = "hashi_relay_connect_failures_total";
    /// Total bytes written to targets.
    pub const BYTES_UPSTREAM: &str = "hashi_relay_bytes_upstream_total";
    /// Total bytes read from targets.
    pub const BYTES_DOWNSTREAM: &str = "hashi_relay_bytes_downstream_total";
}

/// Record a new session being registered.
#[inline]
pub fn session_opened() {
    metrics::gauge!(names::SESSIONS_ACTIVE).increment(1);
    metrics::counter!(names::SESSIONS_OPENED).increment(1);
}

/// Record a session leaving the store.
#[inline]
pub fn session_removed() {
    metrics::gauge!(names::SESSIONS_ACTIVE).decrement(1);
    metrics::counter!(names::SESSIONS_REMOVED).increment(1);
}

/// Record a failed outbound connect.
#[inline]
pub fn connect_failed() {
    metrics::counter!(names::CONNECT_FAILURES).increment(1);
}

/// Record bytes written to a target.
#[inline]
pub fn bytes_upstream(bytes: usize) {
    metrics::counter!(names::BYTES_UPSTREAM).increment(bytes as u64);
}

/// Record bytes read from a target.
#[inline]
pub fn bytes_downstream(bytes: usize) {
    metrics::counter!(names::BYTES_DOWNSTREAM).increment(bytes as u64);
}
