//! Session registry.

use std::{
    collections::{BTreeMap, btree_map::Entry},
    sync::Arc,
};

use async_lock::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{
    config::RelayConfig,
    session::{Session, SessionId, Status},
};

/// Thread-safe map from [`SessionId`] to [`Session`].
///
/// Cloning is cheap; clones share the same sessions.
#[derive(Debug, Clone)]
pub struct SessionStore {
    sessions: Arc<RwLock<BTreeMap<SessionId, Arc<Session>>>>,
    config: RelayConfig,
}

impl SessionStore {
    /// Create an empty store.
    #[must_use]
    pub fn new(config: RelayConfig) -> Self {
        Self {
            sessions: Arc::new(RwLock::new(BTreeMap::new())),
            config,
        }
    }

    /// The configuration shared by every session in this store.
    #[must_use]
    pub const fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Register a new session and start connecting it in the background.
    ///
    /// Returns as soon as the session is registered; the connect does not
    /// need to finish first. The session is evicted when its connection
    /// closes.
    pub async fn create(&self, host: impl Into<String>, port: u16) -> SessionId {
        let host = host.into();
        let session = {
            let mut sessions = self.sessions.write().await;
            loop {
                let id = SessionId::random();
                if let Entry::Vacant(slot) = sessions.entry(id) {
                    let session = Arc::new(Session::new(id, host, port));
                    slot.insert(session.clone());
                    break session;
                }
            }
        };

        let id = session.id();
        tracing::info!(session_id = %id, host = %session.host(), port, "created session");

        #[cfg(feature = "metrics")]
        crate::metrics::session_opened();

        let store = self.clone();
        let config = self.config;
        tokio::spawn(async move {
            session.run(&config).await;
            if session.status().await == Status::Closed {
                store.evict(id, &session).await;
            }
        });

        id
    }

    /// Look up a session.
    pub async fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Remove a session and shut it down. Idempotent.
    pub async fn remove(&self, id: &SessionId) {
        let removed = self.sessions.write().await.remove(id);
        if let Some(session) = removed {
            session.shutdown().await;
            tracing::info!(session_id = %id, "removed session");

            #[cfg(feature = "metrics")]
            crate::metrics::session_removed();
        }
    }

    /// Remove and shut down every session.
    pub async fn close_all(&self) {
        let drained = core::mem::take(&mut *self.sessions.write().await);
        let count = drained.len();
        for session in drained.into_values() {
            session.shutdown().await;

            #[cfg(feature = "metrics")]
            crate::metrics::session_removed();
        }
        if count > 0 {
            tracing::info!(count, "closed all sessions");
        }
    }

    /// Number of registered sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether no sessions are registered.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Remove every session idle for longer than the session timeout.
    ///
    /// Returns the number of sessions evicted.
    pub async fn evict_expired(&self) -> usize {
        let now = Instant::now();
        let snapshot: Vec<(SessionId, Arc<Session>)> = self
            .sessions
            .read()
            .await
            .iter()
            .map(|(id, session)| (*id, session.clone()))
            .collect();

        let mut evicted = 0;
        for (id, session) in snapshot {
            if session.idle_for(now).await > self.config.session_timeout {
                tracing::debug!(session_id = %id, "session expired");
                self.evict(id, &session).await;
                evicted += 1;
            }
        }
        evicted
    }

    /// Run [`SessionStore::evict_expired`] every sweep interval until
    /// `token` is cancelled.
    pub async fn run_expiry(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let evicted = self.evict_expired().await;
                    if evicted > 0 {
                        tracing::info!(evicted, "evicted idle sessions");
                    }
                }
                () = token.cancelled() => {
                    tracing::debug!("stopping session expiry task");
                    break;
                }
            }
        }
    }

    /// Remove `session` only if the id still maps to that exact session.
    async fn evict(&self, id: SessionId, session: &Arc<Session>) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            match sessions.get(&id) {
                Some(current) if Arc::ptr_eq(current, session) => sessions.remove(&id),
                _ => None,
            }
        };

        if let Some(session) = removed {
            session.shutdown().await;
            tracing::info!(session_id = %id, "evicted session");

            #[cfg(feature = "metrics")]
            crate::metrics::session_removed();
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(RelayConfig::default())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use bytes::Bytes;
    use core::time::Duration;
    use testresult::TestResult;
    use tokio::{io::AsyncReadExt, net::TcpListener};

    async fn wait_until_gone(store: &SessionStore, id: &SessionId) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while store.get(id).await.is_some() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("session evicted in time");
    }

    #[tokio::test]
    async fn create_and_get_session() -> TestResult {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let store = SessionStore::default();

        let id = store.create("127.0.0.1", port).await;
        let session = store.get(&id).await.expect("session registered");
        assert_eq!(session.id(), id);
        assert_eq!(session.port(), port);
        assert_eq!(store.len().await, 1);
        Ok(())
    }

    #[tokio::test]
    async fn remove_is_idempotent() -> TestResult {
        let store = SessionStore::default();
        let id = store.create("127.0.0.1", 9).await;
        let session = store.get(&id).await.expect("session registered");

        store.remove(&id).await;
        store.remove(&id).await;

        assert!(store.get(&id).await.is_none());
        assert!(store.is_empty().await);
        assert!(!session.is_usable().await);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_creates_never_collide() -> TestResult {
        let store = SessionStore::default();
        let mut handles = Vec::new();
        for _ in 0..64 {
            let store = store.clone();
            handles.push(tokio::spawn(async move { store.create("127.0.0.1", 9).await }));
        }

        let mut ids = BTreeSet::new();
        for handle in handles {
            assert!(ids.insert(handle.await?), "duplicate session id");
        }
        assert_eq!(ids.len(), 64);
        Ok(())
    }

    #[tokio::test]
    async fn remote_close_evicts_session() -> TestResult {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let store = SessionStore::default();

        let id = store.create("127.0.0.1", port).await;
        let session = store.get(&id).await.expect("session registered");
        session.write(Bytes::from_static(b"GET")).await?;

        let (mut peer, _) = listener.accept().await?;
        let mut buf = [0u8; 3];
        peer.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"GET");
        drop(peer);

        wait_until_gone(&store, &id).await;
        assert!(!session.is_usable().await);
        Ok(())
    }

    #[tokio::test]
    async fn failed_connect_stays_registered_but_unusable() -> TestResult {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            listener.local_addr()?.port()
        };
        let store = SessionStore::default();
        let id = store.create("127.0.0.1", port).await;
        let session = store.get(&id).await.expect("session registered");

        tokio::time::timeout(Duration::from_secs(5), async {
            while session.status().await != Status::Error {
                tokio::task::yield_now().await;
            }
        })
        .await?;

        assert!(store.get(&id).await.is_some());
        assert!(!session.is_usable().await);
        Ok(())
    }

    #[tokio::test]
    async fn idle_sessions_expire() -> TestResult {
        let store = SessionStore::new(
            RelayConfig::default().session_timeout(Duration::from_millis(20)),
        );
        let id = store.create("127.0.0.1", 9).await;

        assert_eq!(store.evict_expired().await, 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.evict_expired().await, 1);
        assert!(store.get(&id).await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn expiry_task_sweeps_until_cancelled() -> TestResult {
        let store = SessionStore::new(
            RelayConfig::default()
                .session_timeout(Duration::from_millis(20))
                .sweep_interval(Duration::from_millis(10)),
        );
        let id = store.create("127.0.0.1", 9).await;

        let token = CancellationToken::new();
        let sweeper = {
            let store = store.clone();
            let token = token.clone();
            tokio::spawn(async move { store.run_expiry(token).await })
        };

        wait_until_gone(&store, &id).await;

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), sweeper).await??;
        Ok(())
    }

    #[tokio::test]
    async fn close_all_releases_readers_and_empties_the_store() -> TestResult {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let store = SessionStore::default();

        let id = store.create("127.0.0.1", port).await;
        let session = store.get(&id).await.expect("session registered");
        let (mut peer, _) = listener.accept().await?;

        let reader = session.clone();
        let pending = tokio::spawn(async move { reader.read(Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        store.close_all().await;

        assert!(store.is_empty().await);
        assert_eq!(session.status().await, Status::Closed);
        assert!(pending.await?.is_err());

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), peer.read(&mut buf)).await??;
        assert_eq!(n, 0, "target sees EOF");
        Ok(())
    }
}
