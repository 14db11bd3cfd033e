//! Shared HTTP client with connection pooling.
//!
//! Wraps `reqwest::Client` and rebuilds it when [`HttpSettings`] change.
//! The client is safe to clone (internally `Arc`-ed) and can be shared
//! across every backend client.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::config::HttpSettings;
use crate::errors::{GcloudError, Result};

/// A shared HTTP client that can be rebuilt with new transport settings.
///
/// Internally holds an `Arc<RwLock<reqwest::Client>>` so clones are cheap
/// and reads are non-blocking when no rebuild is in progress.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<RwLock<reqwest::Client>>,
}

impl HttpClient {
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        let client = Self::build_client(settings)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(client)),
        })
    }

    pub fn from_defaults() -> Result<Self> {
        Self::new(&HttpSettings::default())
    }

    /// Get a clone of the current `reqwest::Client`.
    ///
    /// `reqwest::Client` is internally `Arc`-ed, so cloning is cheap.
    pub async fn get_client(&self) -> reqwest::Client {
        self.inner.read().await.clone()
    }

    /// Rebuild the inner client. Connections created before the call keep
    /// the client they were built with.
    pub async fn update(&self, settings: &HttpSettings) -> Result<()> {
        let new_client = Self::build_client(settings)?;
        *self.inner.write().await = new_client;
        Ok(())
    }

    fn build_client(settings: &HttpSettings) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .pool_max_idle_per_host(settings.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(settings.pool_idle_timeout_secs))
            .build()
            .map_err(GcloudError::Http)
    }
}
