//! A relay session: one outbound TCP connection, its buffers, and its state.
//!
//! ```text
//!  Created ──► Connecting ──► Connected ──► Closed
//!     │            │              │
//!     └────────────┴──────────────┴──► Error (connect failed)
//! ```
//!
//! Writes made before the connection is up are parked in a pending buffer and
//! flushed as a single write the moment it comes up. After that they go
//! straight to the connection's writer.

use core::{fmt, time::Duration};

use async_lock::Mutex;
use bytes::{Bytes, BytesMut};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::mpsc,
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use crate::{
    config::RelayConfig,
    error::SessionError,
    long_poll::{Delivery, ReaderSlot, Registration},
};

/// An opaque 128-bit session identifier.
///
/// Drawn from the thread-local CSPRNG and rendered as 32 lowercase hex
/// characters. Holding it is the only authorization the relay checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionId([u8; 16]);

impl SessionId {
    /// Generate a new random session ID.
    #[must_use]
    pub fn random() -> Self {
        Self(rand::random())
    }

    /// Create a session ID from raw bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Encode the session ID as 32 lowercase hex characters.
    #[must_use]
    pub fn to_hex(&self) -> String {
        self.to_string()
    }

    /// Decode a session ID from its hex form. Either letter case is accepted.
    ///
    /// Returns `None` unless the string is exactly 32 hex characters.
    #[must_use]
    pub fn from_hex(s: &str) -> Option<Self> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let n = u128::from_str_radix(s, 16).ok()?;
        Some(Self(n.to_be_bytes()))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", u128::from_be_bytes(self.0))
    }
}

/// Connection status of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// Registered, connect not started yet.
    Created,

    /// TCP handshake in flight.
    Connecting,

    /// Connection up; writes go straight through.
    Connected,

    /// Connection closed locally or by the peer. Terminal.
    Closed,

    /// Connect failed. Terminal.
    Error,
}

impl Status {
    /// Whether reads and writes are still accepted.
    #[must_use]
    pub const fn is_usable(self) -> bool {
        !matches!(self, Self::Closed | Self::Error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Closed => "closed",
            Self::Error => "error",
        })
    }
}

#[derive(Debug)]
struct State {
    status: Status,
    last_activity: Instant,

    /// Bytes written before the connection came up.
    pending_out: BytesMut,

    /// Feeds the connection's writer loop once connected.
    writer: Option<mpsc::UnboundedSender<Bytes>>,

    reader: ReaderSlot,
}

impl State {
    const fn ensure_usable(&self) -> Result<(), SessionError> {
        if self.status.is_usable() {
            Ok(())
        } else {
            Err(SessionError::Unusable {
                status: self.status,
            })
        }
    }
}

/// Server-side record binding one session id to one outbound TCP connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    host: String,
    port: u16,
    state: Mutex<State>,
    shutdown: CancellationToken,
}

impl Session {
    /// Create a session in [`Status::Created`]. Nothing is dialed until
    /// [`Session::run`] is driven.
    #[must_use]
    pub fn new(id: SessionId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            state: Mutex::new(State {
                status: Status::Created,
                last_activity: Instant::now(),
                pending_out: BytesMut::new(),
                writer: None,
                reader: ReaderSlot::new(),
            }),
            shutdown: CancellationToken::new(),
        }
    }

    /// The session's id.
    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// Target host.
    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Target port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Current connection status.
    pub async fn status(&self) -> Status {
        self.state.lock().await.status
    }

    /// False once the session is closed or its connect failed.
    pub async fn is_usable(&self) -> bool {
        self.status().await.is_usable()
    }

    /// Time since the client last touched this session.
    ///
    /// A session with a reader waiting on it is never idle.
    pub async fn idle_for(&self, now: Instant) -> Duration {
        let state = self.state.lock().await;
        if state.reader.has_reader() {
            return Duration::ZERO;
        }
        now.saturating_duration_since(state.last_activity)
    }

    /// Bytes queued while the connection is not up yet.
    pub async fn pending_outbound(&self) -> Bytes {
        Bytes::copy_from_slice(&self.state.lock().await.pending_out)
    }

    /// Queue or send bytes toward the target.
    ///
    /// Before the connection is up the bytes are parked; afterwards they are
    /// handed to the writer loop. No backpressure is applied.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Unusable`] if the session is closed or failed.
    pub async fn write(&self, data: Bytes) -> Result<(), SessionError> {
        let mut state = self.state.lock().await;
        state.ensure_usable()?;
        state.last_activity = Instant::now();

        if state.status != Status::Connected {
            state.pending_out.extend_from_slice(&data);
            return Ok(());
        }

        let len = data.len();
        let sent = state.writer.as_ref().is_some_and(|tx| tx.send(data).is_ok());
        if !sent {
            return Err(SessionError::Unusable {
                status: Status::Closed,
            });
        }

        tracing::trace!(session_id = %self.id, len, "queued outbound bytes");
        Ok(())
    }

    /// Register a long-poll reader without waiting on it.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Unusable`] if the session is closed or failed,
    /// or [`SessionError::ReaderBusy`] if another reader is already waiting.
    pub async fn register_reader(&self) -> Result<Registration, SessionError> {
        let mut state = self.state.lock().await;
        state.ensure_usable()?;
        state.last_activity = Instant::now();
        state.reader.register()
    }

    /// Long-poll for inbound bytes.
    ///
    /// Returns `Ok(None)` if nothing arrived within `wait`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Unusable`] if the session is unusable on entry
    /// or closes while waiting, or [`SessionError::ReaderBusy`] if another
    /// reader is already waiting.
    pub async fn read(&self, wait: Duration) -> Result<Option<Bytes>, SessionError> {
        let mut rx = match self.register_reader().await? {
            Registration::Ready(data) => return Ok(Some(data)),
            Registration::Waiting(rx) => rx,
        };

        let delivery = match tokio::time::timeout(wait, &mut rx).await {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => Delivery::EndOfStream,
            Err(_elapsed) => {
                // Seal the slot, then pick up anything sent just before.
                rx.close();
                match rx.try_recv() {
                    Ok(delivery) => delivery,
                    Err(_) => {
                        let late = self.complete_read(Bytes::new()).await;
                        return Ok((!late.is_empty()).then_some(late));
                    }
                }
            }
        };

        match delivery {
            Delivery::Data(data) => Ok(Some(self.complete_read(data).await)),
            Delivery::EndOfStream => Err(self.gone().await),
        }
    }

    /// Close out a long poll: refresh the activity clock and pick up bytes
    /// that landed between the wake-up and now.
    async fn complete_read(&self, delivered: Bytes) -> Bytes {
        let mut state = self.state.lock().await;
        state.last_activity = Instant::now();
        state.reader.complete(delivered)
    }

    /// Tear the session down. Idempotent.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.finish(Status::Closed).await;
    }

    /// Dial the target and pump bytes until either side closes.
    ///
    /// Only the first call does anything; a session connects at most once.
    pub async fn run(&self, config: &RelayConfig) {
        {
            let mut state = self.state.lock().await;
            if state.status != Status::Created {
                tracing::warn!(
                    session_id = %self.id,
                    status = %state.status,
                    "session already started"
                );
                return;
            }
            state.status = Status::Connecting;
        }

        tracing::debug!(session_id = %self.id, host = %self.host, port = self.port, "connecting");

        let connect = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        );

        let stream = tokio::select! {
            () = self.shutdown.cancelled() => {
                self.finish(Status::Closed).await;
                return;
            }
            res = connect => match res {
                Ok(Ok(stream)) => stream,
                Ok(Err(e)) => {
                    tracing::warn!(
                        session_id = %self.id,
                        host = %self.host,
                        port = self.port,
                        error = %e,
                        "connect failed"
                    );
                    self.finish(Status::Error).await;
                    return;
                }
                Err(_elapsed) => {
                    tracing::warn!(
                        session_id = %self.id,
                        host = %self.host,
                        port = self.port,
                        "connect timed out"
                    );
                    self.finish(Status::Error).await;
                    return;
                }
            },
        };

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock().await;
            if state.status != Status::Connecting {
                return;
            }
            state.status = Status::Connected;

            let pending = state.pending_out.split().freeze();
            if !pending.is_empty() {
                tracing::debug!(
                    session_id = %self.id,
                    len = pending.len(),
                    "flushing pending writes"
                );
                let _ = tx.send(pending);
            }
            state.writer = Some(tx);
        }

        tracing::info!(session_id = %self.id, host = %self.host, port = self.port, "connected");

        let (read_half, write_half) = stream.into_split();
        tokio::select! {
            () = self.shutdown.cancelled() => {
                tracing::debug!(session_id = %self.id, "shutdown requested");
            }
            res = self.pump_inbound(read_half, config) => match res {
                Ok(()) => tracing::debug!(session_id = %self.id, "target closed the connection"),
                Err(e) => {
                    tracing::debug!(session_id = %self.id, error = %e, "read from target failed");
                }
            },
            res = pump_outbound(write_half, rx) => if let Err(e) = res {
                tracing::debug!(session_id = %self.id, error = %e, "write to target failed");
            },
        }

        self.finish(Status::Closed).await;
    }

    async fn pump_inbound(
        &self,
        mut read_half: OwnedReadHalf,
        config: &RelayConfig,
    ) -> std::io::Result<()> {
        let mut buf = BytesMut::with_capacity(config.read_chunk_size);
        loop {
            buf.clear();
            if read_half.read_buf(&mut buf).await? == 0 {
                return Ok(());
            }

            #[cfg(feature = "metrics")]
            crate::metrics::bytes_downstream(buf.len());

            let mut state = self.state.lock().await;
            let delivered = state.reader.push(&buf);
            let buffered = state.reader.buffered().len();
            drop(state);

            tracing::trace!(session_id = %self.id, len = buf.len(), delivered, "inbound bytes");
            if buffered > config.max_inbound_bytes {
                tracing::warn!(
                    session_id = %self.id,
                    buffered,
                    limit = config.max_inbound_bytes,
                    "client is not draining inbound bytes"
                );
                return Err(std::io::Error::other("inbound buffer limit exceeded"));
            }
        }
    }

    /// Move to a terminal status and release the waiting reader. Only the
    /// first terminal transition sticks.
    async fn finish(&self, status: Status) {
        let mut state = self.state.lock().await;
        if !state.status.is_usable() {
            return;
        }

        state.status = status;
        state.writer = None;
        state.pending_out.clear();
        state.reader.release();
        drop(state);

        #[cfg(feature = "metrics")]
        if status == Status::Error {
            crate::metrics::connect_failed();
        }

        tracing::info!(session_id = %self.id, %status, "session finished");
    }

    async fn gone(&self) -> SessionError {
        let status = self.status().await;
        SessionError::Unusable {
            status: if status.is_usable() {
                Status::Closed
            } else {
                status
            },
        }
    }
}

async fn pump_outbound(
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) -> std::io::Result<()> {
    while let Some(chunk) = rx.recv().await {
        write_half.write_all(&chunk).await?;

        #[cfg(feature = "metrics")]
        crate::metrics::bytes_upstream(chunk.len());
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::panic)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use testresult::TestResult;
    use tokio::net::TcpListener;

    fn config() -> RelayConfig {
        RelayConfig::default().connect_timeout(Duration::from_secs(5))
    }

    async fn listener() -> std::io::Result<(TcpListener, u16)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok((listener, port))
    }

    async fn wait_for(session: &Session, status: Status) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while session.status().await != status {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("status reached in time");
    }

    async fn wait_for_reader(session: &Session) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !session.state.lock().await.reader.has_reader() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("reader registered in time");
    }

    #[test]
    fn session_id_hex_roundtrip() {
        let id = SessionId::random();
        let hex = id.to_hex();
        assert_eq!(hex.len(), 32);
        assert_eq!(SessionId::from_hex(&hex), Some(id));
    }

    #[test]
    fn session_id_from_hex_rejects_invalid() {
        assert!(SessionId::from_hex("").is_none());
        assert!(SessionId::from_hex("abc123").is_none());
        assert!(SessionId::from_hex("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz").is_none());
    }

    #[test]
    fn session_id_accepts_uppercase_hex() {
        let id = SessionId::from_bytes([0xab; 16]);
        assert_eq!(SessionId::from_hex(&id.to_hex().to_uppercase()), Some(id));
    }

    #[test]
    fn session_id_rejects_signed_hex() {
        let signed = format!("+{}", "0".repeat(31));
        assert!(SessionId::from_hex(&signed).is_none());
    }

    #[test]
    fn session_id_keeps_leading_zeros() {
        let hex = SessionId::from_bytes(1u128.to_be_bytes()).to_hex();
        assert_eq!(hex, format!("{}1", "0".repeat(31)));
    }

    #[test]
    fn terminal_statuses_are_unusable() {
        assert!(Status::Created.is_usable());
        assert!(Status::Connecting.is_usable());
        assert!(Status::Connected.is_usable());
        assert!(!Status::Closed.is_usable());
        assert!(!Status::Error.is_usable());
    }

    #[tokio::test]
    async fn writes_before_connect_are_flushed_as_one_block() -> TestResult {
        let (listener, port) = listener().await?;
        let session = Arc::new(Session::new(SessionId::random(), "127.0.0.1", port));

        session.write(Bytes::from_static(b"W1")).await?;
        session.write(Bytes::from_static(b"W2")).await?;
        assert_eq!(session.status().await, Status::Created);
        assert_eq!(&session.pending_outbound().await[..], b"W1W2");

        let runner = session.clone();
        tokio::spawn(async move { runner.run(&config()).await });

        let (mut peer, _) = listener.accept().await?;
        let mut first = [0u8; 4];
        peer.read_exact(&mut first).await?;
        assert_eq!(&first, b"W1W2");

        wait_for(&session, Status::Connected).await;
        assert!(session.pending_outbound().await.is_empty());

        session.write(Bytes::from_static(b"W3")).await?;
        let mut next = [0u8; 2];
        peer.read_exact(&mut next).await?;
        assert_eq!(&next, b"W3");
        Ok(())
    }

    #[tokio::test]
    async fn inbound_bytes_reach_the_reader() -> TestResult {
        let (listener, port) = listener().await?;
        let session = Arc::new(Session::new(SessionId::random(), "127.0.0.1", port));

        let runner = session.clone();
        tokio::spawn(async move { runner.run(&config()).await });

        let (mut peer, _) = listener.accept().await?;
        wait_for(&session, Status::Connected).await;

        let reader = session.clone();
        let pending = tokio::spawn(async move { reader.read(Duration::from_secs(5)).await });

        peer.write_all(b"pong").await?;
        let data = pending.await??.expect("data before timeout");
        assert_eq!(&data[..], b"pong");
        Ok(())
    }

    #[tokio::test]
    async fn read_times_out_without_data() -> TestResult {
        let session = Session::new(SessionId::random(), "127.0.0.1", 9);
        assert_eq!(session.read(Duration::from_millis(20)).await?, None);

        // the timed-out reader no longer blocks the slot
        assert_eq!(session.read(Duration::from_millis(20)).await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn remote_close_releases_pending_reader() -> TestResult {
        let (listener, port) = listener().await?;
        let session = Arc::new(Session::new(SessionId::random(), "127.0.0.1", port));

        let runner = session.clone();
        tokio::spawn(async move { runner.run(&config()).await });

        let (peer, _) = listener.accept().await?;
        wait_for(&session, Status::Connected).await;

        let reader = session.clone();
        let pending = tokio::spawn(async move { reader.read(Duration::from_secs(5)).await });
        tokio::task::yield_now().await;
        drop(peer);

        let err = pending.await?.expect_err("reader released with an error");
        assert_eq!(
            err,
            SessionError::Unusable {
                status: Status::Closed
            }
        );
        assert_eq!(session.status().await, Status::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn closed_session_rejects_reads_and_writes() -> TestResult {
        let session = Session::new(SessionId::random(), "127.0.0.1", 9);
        session.shutdown().await;

        let gone = SessionError::Unusable {
            status: Status::Closed,
        };
        assert_eq!(session.write(Bytes::from_static(b"x")).await, Err(gone));
        assert_eq!(session.read(Duration::from_millis(10)).await, Err(gone));

        // shutting down twice keeps the first terminal status
        session.shutdown().await;
        assert_eq!(session.status().await, Status::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn connect_failure_moves_to_error() -> TestResult {
        // bind then drop to get a port with nothing listening
        let port = {
            let (_listener, port) = listener().await?;
            port
        };

        let session = Session::new(SessionId::random(), "127.0.0.1", port);
        session.write(Bytes::from_static(b"lost")).await?;
        session.run(&config()).await;

        assert_eq!(session.status().await, Status::Error);
        assert_eq!(
            session.write(Bytes::from_static(b"x")).await,
            Err(SessionError::Unusable {
                status: Status::Error
            })
        );
        Ok(())
    }

    #[tokio::test]
    async fn run_connects_at_most_once() -> TestResult {
        let session = Session::new(SessionId::random(), "127.0.0.1", 9);
        session.shutdown().await;
        session.run(&config()).await;
        assert_eq!(session.status().await, Status::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn second_run_on_a_live_session_does_not_redial() -> TestResult {
        let (listener, port) = listener().await?;
        let session = Arc::new(Session::new(SessionId::random(), "127.0.0.1", port));

        let runner = session.clone();
        tokio::spawn(async move { runner.run(&config()).await });

        let (_peer, _) = listener.accept().await?;
        wait_for(&session, Status::Connected).await;

        tokio::time::timeout(Duration::from_secs(1), session.run(&config()))
            .await
            .expect("second run returns at once");
        assert_eq!(session.status().await, Status::Connected);

        let redial = tokio::time::timeout(Duration::from_millis(100), listener.accept()).await;
        assert!(redial.is_err(), "no second connection");
        Ok(())
    }

    #[tokio::test]
    async fn connect_timeout_moves_to_error() -> TestResult {
        // non-routable: either hangs until the timeout or fails outright
        let session = Session::new(SessionId::random(), "10.255.255.1", 80);
        let config = RelayConfig::default().connect_timeout(Duration::from_millis(50));

        tokio::time::timeout(Duration::from_secs(5), session.run(&config)).await?;
        assert_eq!(session.status().await, Status::Error);
        Ok(())
    }

    #[tokio::test(flavor = "current_thread")]
    async fn pending_reader_takes_bytes_pushed_after_wake_up() -> TestResult {
        let session = Arc::new(Session::new(SessionId::random(), "127.0.0.1", 9));

        let reader = session.clone();
        let pending = tokio::spawn(async move { reader.read(Duration::from_secs(5)).await });
        wait_for_reader(&session).await;

        // both land before the reader task gets to run again
        {
            let mut state = session.state.lock().await;
            state.reader.push(b"Y1");
            state.reader.push(b"Y2");
        }

        let data = pending.await??.expect("data before timeout");
        assert_eq!(&data[..], b"Y1Y2");
        assert!(session.state.lock().await.reader.buffered().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn waiting_reader_keeps_the_session_active() -> TestResult {
        let session = Arc::new(Session::new(SessionId::random(), "127.0.0.1", 9));

        let reader = session.clone();
        let pending = tokio::spawn(async move { reader.read(Duration::from_secs(5)).await });
        wait_for_reader(&session).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(session.idle_for(Instant::now()).await, Duration::ZERO);

        session.shutdown().await;
        assert!(pending.await?.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn finished_poll_restarts_the_idle_clock() -> TestResult {
        let session = Session::new(SessionId::random(), "127.0.0.1", 9);
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(session.read(Duration::from_millis(30)).await?, None);
        assert!(session.idle_for(Instant::now()).await < Duration::from_millis(30));
        Ok(())
    }

    #[tokio::test]
    async fn unread_inbound_past_the_limit_closes_the_session() -> TestResult {
        let (listener, port) = listener().await?;
        let session = Arc::new(Session::new(SessionId::random(), "127.0.0.1", port));
        let config = config().max_inbound_bytes(8);

        let runner = session.clone();
        tokio::spawn(async move { runner.run(&config).await });

        let (mut peer, _) = listener.accept().await?;
        wait_for(&session, Status::Connected).await;

        peer.write_all(b"0123456789abcdef").await?;
        wait_for(&session, Status::Closed).await;

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), peer.read(&mut buf)).await??;
        assert_eq!(n, 0, "target sees EOF");
        Ok(())
    }
}
