//! Single-pending-reader delivery over a session's inbound buffer.
//!
//! ```text
//! target ──► push(chunk) ──► inbound buffer ──┐
//!                                             ├──► oneshot ──► GET /read
//! GET /read ──► register() ──► reader slot ───┘
//! ```
//!
//! At most one reader waits at a time. Whatever has accumulated when the
//! reader is served is handed over in one piece, so a single poll may carry
//! bytes from several network reads.

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

use crate::error::SessionError;

/// What a waiting reader eventually receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Every inbound byte accumulated at delivery time.
    Data(Bytes),

    /// The session closed or failed before any data arrived.
    EndOfStream,
}

/// Outcome of registering a reader.
#[derive(Debug)]
pub enum Registration {
    /// The inbound buffer was non-empty; its contents are returned directly.
    Ready(Bytes),

    /// Nothing buffered yet; the receiver resolves on the next arrival.
    Waiting(oneshot::Receiver<Delivery>),
}

/// Inbound buffer plus the one-slot reader registration.
#[derive(Debug, Default)]
pub struct ReaderSlot {
    inbound: BytesMut,
    pending: Option<oneshot::Sender<Delivery>>,
}

impl ReaderSlot {
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes received but not yet delivered.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.inbound
    }

    /// Whether a live reader is waiting.
    ///
    /// A reader whose receiver was dropped (cancelled request, poll timeout)
    /// does not count.
    #[must_use]
    pub fn has_reader(&self) -> bool {
        self.pending.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// Register a reader.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::ReaderBusy`] if another live reader is waiting.
    pub fn register(&mut self) -> Result<Registration, SessionError> {
        if self.has_reader() {
            return Err(SessionError::ReaderBusy);
        }
        self.pending = None;

        if !self.inbound.is_empty() {
            return Ok(Registration::Ready(self.inbound.split().freeze()));
        }

        let (tx, rx) = oneshot::channel();
        self.pending = Some(tx);
        Ok(Registration::Waiting(rx))
    }

    /// Append freshly received bytes and serve the waiting reader, if any.
    ///
    /// Returns the number of bytes handed to a reader.
    pub fn push(&mut self, chunk: &[u8]) -> usize {
        self.inbound.extend_from_slice(chunk);

        let Some(tx) = self.pending.take() else {
            return 0;
        };

        let data = self.inbound.split().freeze();
        let len = data.len();
        match tx.send(Delivery::Data(data)) {
            Ok(()) => len,
            Err(Delivery::Data(data)) => {
                // reader went away; keep the bytes for the next one
                let mut restored = BytesMut::from(&data[..]);
                restored.extend_from_slice(&self.inbound);
                self.inbound = restored;
                0
            }
            Err(Delivery::EndOfStream) => 0,
        }
    }

    /// Append everything buffered since `delivered` was handed out.
    ///
    /// A reader woken by one chunk may resume after more have arrived; this
    /// folds them into the same reply and leaves the buffer empty.
    pub fn complete(&mut self, delivered: Bytes) -> Bytes {
        if self.inbound.is_empty() {
            return delivered;
        }
        if delivered.is_empty() {
            return self.inbound.split().freeze();
        }

        let mut joined = BytesMut::with_capacity(delivered.len() + self.inbound.len());
        joined.extend_from_slice(&delivered);
        joined.extend_from_slice(&self.inbound.split());
        joined.freeze()
    }

    /// Resolve a waiting reader with [`Delivery::EndOfStream`].
    pub fn release(&mut self) {
        if let Some(tx) = self.pending.take() {
            let _ = tx.send(Delivery::EndOfStream);
        }
    }
}
