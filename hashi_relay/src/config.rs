//! Relay tuning knobs.

use core::time::Duration;

use crate::{
    DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_MAX_INBOUND_BYTES, DEFAULT_POLL_TIMEOUT_SECS,
    DEFAULT_READ_CHUNK_SIZE, DEFAULT_SESSION_TIMEOUT_SECS, DEFAULT_SWEEP_INTERVAL_SECS,
};

/// Timeouts and buffer sizes shared by every session in a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayConfig {
    /// How long a `/read` waits for data before answering "no data".
    pub poll_timeout: Duration,

    /// Idle time after which a session is evicted.
    pub session_timeout: Duration,

    /// Upper bound on the outbound TCP handshake.
    pub connect_timeout: Duration,

    /// How often the expiry sweeper runs.
    pub sweep_interval: Duration,

    /// Buffer size for each read from the target connection.
    pub read_chunk_size: usize,

    /// Most inbound bytes held for a session before it is closed.
    pub max_inbound_bytes: usize,
}

impl RelayConfig {
    /// Set the long-poll timeout.
    #[must_use]
    pub const fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    /// Set the idle session timeout.
    #[must_use]
    pub const fn session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the outbound connect timeout.
    #[must_use]
    pub const fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the expiry sweep interval.
    #[must_use]
    pub const fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the read chunk size. Zero is bumped to one byte.
    #[must_use]
    pub const fn read_chunk_size(mut self, size: usize) -> Self {
        self.read_chunk_size = if size == 0 { 1 } else { size };
        self
    }

    /// Set the inbound buffer cap.
    #[must_use]
    pub const fn max_inbound_bytes(mut self, limit: usize) -> Self {
        self.max_inbound_bytes = limit;
        self
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(DEFAULT_POLL_TIMEOUT_SECS),
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            max_inbound_bytes: DEFAULT_MAX_INBOUND_BYTES,
        }
    }
}
