//! Access-token sources for the REST connections.
//!
//! Every backend authenticates with a bearer token obtained from a
//! [`TokenProvider`]:
//!
//! - [`ServiceAccountTokenProvider`]: JWT bearer grant signed with a service
//!   account key (Pub/Sub, Storage, Tasks)
//! - [`InstalledAppTokenProvider`]: user OAuth2 with a persisted token file
//!   (Drive)
//! - [`StaticToken`]: a fixed token for emulators and pre-provisioned setups

pub mod installed;
pub mod service_account;

use async_trait::async_trait;

use crate::errors::Result;

pub use installed::{
    AuthorizationCodeSource, ClientSecret, ConsolePrompt, InstalledAppTokenProvider,
    NonInteractive, StoredToken,
};
pub use service_account::{ServiceAccountKey, ServiceAccountTokenProvider};

pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";

/// Source of bearer tokens for outgoing requests.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Return a currently valid access token, refreshing it if needed.
    async fn access_token(&self) -> Result<String>;
}

/// A fixed bearer token.
#[derive(Clone)]
pub struct StaticToken {
    token: String,
}

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl std::fmt::Debug for StaticToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("StaticToken").field(&"[REDACTED]").finish()
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn access_token(&self) -> Result<String> {
        Ok(self.token.clone())
    }
}
