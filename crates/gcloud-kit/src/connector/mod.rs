//! Authenticated REST connections shared by the service clients.
//!
//! A [`Connection`] pairs a base URL with a pooled `reqwest::Client` and a
//! [`TokenProvider`]. Each client keeps one in a [`ConnectionSlot`], creating
//! it on first use and dropping it on `close()`.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use reqwest::{Method, RequestBuilder, Response, Url};
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::auth::{ServiceAccountKey, ServiceAccountTokenProvider, TokenProvider};
use crate::errors::{GcloudError, Result};

pub struct Connection {
    service: &'static str,
    base_url: Url,
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    user_agent: Option<String>,
    signing_key: Option<Arc<ServiceAccountKey>>,
}

impl Connection {
    pub fn new(
        service: &'static str,
        base_url: &str,
        http: reqwest::Client,
        tokens: Arc<dyn TokenProvider>,
    ) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| GcloudError::Config(format!("Invalid {service} endpoint {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(GcloudError::Config(format!(
                "Invalid {service} endpoint {base_url}"
            )));
        }
        Ok(Self {
            service,
            base_url,
            http,
            tokens,
            user_agent: None,
            signing_key: None,
        })
    }

    /// Connection authenticated with a service account key file.
    pub async fn with_service_account(
        service: &'static str,
        base_url: &str,
        key_file: &Path,
        scopes: &[&str],
        http: reqwest::Client,
    ) -> Result<Self> {
        let key = Arc::new(ServiceAccountKey::from_file(key_file).await?);
        let provider = ServiceAccountTokenProvider::new(key.clone(), scopes, http.clone())?;
        info!(service, client_email = %key.client_email, "connecting with service account");
        Ok(Self::new(service, base_url, http, Arc::new(provider))?.with_signing_key(key))
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    #[must_use]
    pub fn with_signing_key(mut self, key: Arc<ServiceAccountKey>) -> Self {
        self.signing_key = Some(key);
        self
    }

    pub fn service(&self) -> &'static str {
        self.service
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn signing_key(&self) -> Option<&Arc<ServiceAccountKey>> {
        self.signing_key.as_ref()
    }

    /// Base URL extended with `segments`, each percent-encoded as a single
    /// path segment (so `/` inside a segment becomes `%2F`).
    ///
    /// `.` and `..` are rejected: the URL parser would resolve them against
    /// the collection instead of addressing a resource.
    pub fn url<I, S>(&self, segments: I) -> Result<Url>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty();
            for segment in segments {
                let segment = segment.as_ref();
                if is_dot_segment(segment) {
                    return Err(GcloudError::InvalidArgument(format!(
                        "Path segment {segment:?} is not a valid {} resource name",
                        self.service
                    )));
                }
                path.push(segment);
            }
        }
        Ok(url)
    }

    /// Request builder carrying the bearer token and user agent.
    pub async fn request(&self, method: Method, url: Url) -> Result<RequestBuilder> {
        let token = self.tokens.access_token().await?;
        let mut builder = self.http.request(method, url).bearer_auth(token);
        if let Some(agent) = &self.user_agent {
            builder = builder.header(reqwest::header::USER_AGENT, agent);
        }
        Ok(builder)
    }

    /// Send the request; non-2xx responses become [`GcloudError::Remote`] or
    /// [`GcloudError::NotFound`] (for `resource`).
    pub async fn execute(&self, builder: RequestBuilder, resource: &str) -> Result<Response> {
        let request = builder.build()?;
        let method = request.method().clone();
        let url = request.url().clone();

        let resp = self.http.execute(request).await?;
        let status = resp.status();
        debug!(service = self.service, %method, %url, status = status.as_u16(), "request");

        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(GcloudError::from_response(
            self.service,
            resource,
            status.as_u16(),
            &body,
        ))
    }

    pub async fn json<T: DeserializeOwned>(
        &self,
        builder: RequestBuilder,
        resource: &str,
    ) -> Result<T> {
        let resp = self.execute(builder, resource).await?;
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub async fn bytes(&self, builder: RequestBuilder, resource: &str) -> Result<Vec<u8>> {
        let resp = self.execute(builder, resource).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    /// Execute and discard the response body.
    pub async fn send(&self, builder: RequestBuilder, resource: &str) -> Result<()> {
        self.execute(builder, resource).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("service", &self.service)
            .field("base_url", &self.base_url.as_str())
            .field("user_agent", &self.user_agent)
            .field("signing_key", &self.signing_key.is_some())
            .finish_non_exhaustive()
    }
}

/// `.` or `..`, which cannot name a remote resource.
pub(crate) fn is_dot_segment(segment: &str) -> bool {
    matches!(segment, "." | "..")
}

/// Lazily-initialized, closable connection holder.
#[derive(Default)]
pub struct ConnectionSlot {
    inner: RwLock<Option<Arc<Connection>>>,
}

impl ConnectionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the live connection, creating it with `init` if there is none.
    /// Concurrent callers wait for the first initialization.
    pub async fn get_or_try_init<F, Fut>(&self, init: F) -> Result<Arc<Connection>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Connection>>,
    {
        if let Some(conn) = self.inner.read().await.as_ref() {
            return Ok(conn.clone());
        }

        let mut guard = self.inner.write().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = Arc::new(init().await?);
        *guard = Some(conn.clone());
        Ok(conn)
    }

    pub async fn current(&self) -> Option<Arc<Connection>> {
        self.inner.read().await.clone()
    }

    /// Drop the connection. Returns whether one was open.
    pub async fn close(&self) -> bool {
        self.inner.write().await.take().is_some()
    }

    pub async fn is_open(&self) -> bool {
        self.inner.read().await.is_some()
    }
}
