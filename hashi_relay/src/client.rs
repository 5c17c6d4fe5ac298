//! HTTP client for the relay.
//!
//! Speaks the same `GET` protocol a browser client would, which makes it handy
//! for tooling and end-to-end tests.

use core::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

use crate::{error::ClientError, session::SessionId, websafe};

/// Default per-request timeout. Must outlast the relay's poll timeout.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

/// A handle on a relay server.
#[derive(Debug, Clone)]
pub struct RelayClient {
    base_url: Url,
    client: Client,
}

impl RelayClient {
    /// Create a client for the relay at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(base_url: Url) -> Result<Self, ClientError> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS))
    }

    /// Create a client with a custom per-request timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn with_timeout(base_url: Url, timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { base_url, client })
    }

    /// Open a session to `host:port`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the relay rejects the target.
    pub async fn open(&self, host: &str, port: u16) -> Result<SessionId, ClientError> {
        let port = port.to_string();
        let url = self.endpoint("/proxy", &[("host", host), ("port", port.as_str())])?;
        let body = self.get_text(url).await?.unwrap_or_default();

        SessionId::from_hex(body.trim()).ok_or_else(|| ClientError::ServerError {
            status: StatusCode::OK.as_u16(),
            message: format!("not a session id: {body:?}"),
        })
    }

    /// Send raw bytes to the target.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Gone`] if the session no longer exists.
    pub async fn write(&self, session_id: SessionId, data: &[u8]) -> Result<(), ClientError> {
        let sid = session_id.to_hex();
        let data = websafe::encode(data);
        let url = self.endpoint("/write", &[("sid", sid.as_str()), ("data", data.as_str())])?;
        self.get_text(url).await?;
        Ok(())
    }

    /// Long-poll for bytes from the target.
    ///
    /// Returns `Ok(None)` when the relay's poll timeout elapsed with no data.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Gone`] if the session is closed or unknown, or
    /// [`ClientError::ReaderBusy`] if another read is outstanding.
    pub async fn read(&self, session_id: SessionId) -> Result<Option<Vec<u8>>, ClientError> {
        let sid = session_id.to_hex();
        let url = self.endpoint("/read", &[("sid", sid.as_str())])?;
        match self.get_text(url).await? {
            Some(body) => Ok(Some(websafe::decode(body.trim())?)),
            None => Ok(None),
        }
    }

    /// Tear the session down.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn close(&self, session_id: SessionId) -> Result<(), ClientError> {
        let sid = session_id.to_hex();
        let url = self.endpoint("/close", &[("sid", sid.as_str())])?;
        self.get_text(url).await?;
        Ok(())
    }

    fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, ClientError> {
        let mut url = self.base_url.join(path)?;
        url.query_pairs_mut().extend_pairs(query);
        Ok(url)
    }

    /// `GET` and classify the status. `None` means 204 No Content.
    async fn get_text(&self, url: Url) -> Result<Option<String>, ClientError> {
        debug!(%url, "relay request");
        let response = self.client.get(url).send().await?;

        match response.status() {
            StatusCode::OK => Ok(Some(response.text().await?)),
            StatusCode::NO_CONTENT => Ok(None),
            StatusCode::GONE => Err(ClientError::Gone),
            StatusCode::CONFLICT => Err(ClientError::ReaderBusy),
            status => Err(ClientError::ServerError {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            }),
        }
    }
}
