//! Installed-application OAuth2 for user-owned Google Drive access.
//!
//! The access/refresh token pair lives in a JSON file. Refreshes and
//! interactive exchanges happen under an exclusive lock on
//! `<token file>.lock`, and the file is re-read once the lock is held so
//! concurrent processes do not all refresh at once.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret as OAuthClientSecret, CsrfToken,
    EndpointNotSet, EndpointSet, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};

use super::{TokenProvider, GOOGLE_AUTH_URL, GOOGLE_TOKEN_URL};
use crate::errors::{GcloudError, Result};
use crate::fileops::{self, lock::FileLock};

const OOB_REDIRECT_URI: &str = "urn:ietf:wg:oauth:2.0:oob";
const EXPIRY_LEEWAY_SECS: i64 = 30;
const LOCK_TIMEOUT: Duration = Duration::from_secs(30);

type GoogleOAuthClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

// ---------------------------------------------------------------------------
// Data models
// ---------------------------------------------------------------------------

/// OAuth2 client registration, read from the client-secret JSON downloaded
/// from the Cloud console.
#[derive(Clone, Deserialize)]
pub struct ClientSecret {
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

fn default_auth_uri() -> String {
    GOOGLE_AUTH_URL.to_string()
}

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URL.to_string()
}

#[derive(Deserialize)]
struct ClientSecretFile {
    installed: Option<ClientSecret>,
    web: Option<ClientSecret>,
}

impl std::fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSecret")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

impl ClientSecret {
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            GcloudError::Credential(format!(
                "Failed to read client secret {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json(&contents)
    }

    /// Accepts the `{"installed": {...}}` / `{"web": {...}}` wrappers as well
    /// as a bare object.
    pub fn from_json(json: &str) -> Result<Self> {
        let malformed =
            |e: serde_json::Error| GcloudError::Credential(format!("Malformed client secret: {e}"));
        let value: serde_json::Value = serde_json::from_str(json).map_err(malformed)?;
        if value.get("installed").is_some() || value.get("web").is_some() {
            let file: ClientSecretFile = serde_json::from_value(value).map_err(malformed)?;
            return file.installed.or(file.web).ok_or_else(|| {
                GcloudError::Credential("Client secret has no installed/web section".into())
            });
        }
        serde_json::from_value(value).map_err(malformed)
    }

    fn redirect_uri(&self) -> &str {
        self.redirect_uris
            .first()
            .map(String::as_str)
            .unwrap_or(OOB_REDIRECT_URI)
    }

    fn oauth2_client(&self) -> Result<GoogleOAuthClient> {
        let auth_url = AuthUrl::new(self.auth_uri.clone())
            .map_err(|e| GcloudError::Credential(format!("Invalid auth URI: {e}")))?;
        let token_url = TokenUrl::new(self.token_uri.clone())
            .map_err(|e| GcloudError::Credential(format!("Invalid token URI: {e}")))?;
        let redirect_url = RedirectUrl::new(self.redirect_uri().to_string())
            .map_err(|e| GcloudError::Credential(format!("Invalid redirect URI: {e}")))?;

        Ok(BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_client_secret(OAuthClientSecret::new(self.client_secret.clone()))
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_redirect_uri(redirect_url))
    }
}

/// Persisted token, field-compatible with the token files Google's client
/// libraries write (`created` + `expires_in` in seconds).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl StoredToken {
    /// A token without `created`/`expires_in` is treated as expired.
    pub fn is_expired_at(&self, now_unix: i64) -> bool {
        match (self.created, self.expires_in) {
            (Some(created), Some(expires_in)) => {
                created + expires_in - EXPIRY_LEEWAY_SECS <= now_unix
            }
            _ => true,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now().timestamp())
    }

    fn from_response(resp: &BasicTokenResponse, previous_refresh: Option<String>) -> Self {
        Self {
            access_token: resp.access_token().secret().clone(),
            refresh_token: resp
                .refresh_token()
                .map(|t| t.secret().clone())
                .or(previous_refresh),
            token_type: default_token_type(),
            scope: resp.scopes().map(|scopes| {
                scopes
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(" ")
            }),
            expires_in: resp.expires_in().map(|d| d.as_secs() as i64),
            created: Some(Utc::now().timestamp()),
        }
    }
}

// ---------------------------------------------------------------------------
// Authorization code sources
// ---------------------------------------------------------------------------

/// Obtains an authorization code for the consent URL.
///
/// The host application decides how, e.g. a console prompt or a local
/// redirect handler.
#[async_trait]
pub trait AuthorizationCodeSource: Send + Sync {
    async fn authorization_code(&self, auth_url: &str) -> Result<String>;
}

#[async_trait]
impl<F> AuthorizationCodeSource for F
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    async fn authorization_code(&self, auth_url: &str) -> Result<String> {
        self(auth_url)
    }
}

/// Prints the consent URL and reads the verification code from the terminal.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsolePrompt;

#[async_trait]
impl AuthorizationCodeSource for ConsolePrompt {
    async fn authorization_code(&self, auth_url: &str) -> Result<String> {
        let url = auth_url.to_string();
        tokio::task::spawn_blocking(move || {
            println!("Open the following link in your browser:\n{url}");
            dialoguer::Input::<String>::new()
                .with_prompt("Enter verification code")
                .interact_text()
                .map(|code| code.trim().to_string())
                .map_err(|e| GcloudError::AuthorizationFlow(format!("Code prompt failed: {e}")))
        })
        .await
        .map_err(|e| GcloudError::AuthorizationFlow(format!("Code prompt aborted: {e}")))?
    }
}

/// Refuses interactive authorization. Tokens must be provisioned out of band.
#[derive(Debug, Clone, Copy, Default)]
pub struct NonInteractive;

#[async_trait]
impl AuthorizationCodeSource for NonInteractive {
    async fn authorization_code(&self, _auth_url: &str) -> Result<String> {
        Err(GcloudError::AuthorizationFlow(
            "Interactive authorization is disabled; provision a token file first".into(),
        ))
    }
}

// ---------------------------------------------------------------------------
// InstalledAppTokenProvider
// ---------------------------------------------------------------------------

pub struct InstalledAppTokenProvider {
    secret: ClientSecret,
    oauth: GoogleOAuthClient,
    http: oauth2::reqwest::Client,
    scopes: Vec<String>,
    token_path: PathBuf,
    lock: FileLock,
    code_source: Arc<dyn AuthorizationCodeSource>,
    token: RwLock<Option<StoredToken>>,
}

impl InstalledAppTokenProvider {
    pub fn new(
        secret: ClientSecret,
        scopes: Vec<String>,
        token_path: PathBuf,
        code_source: Arc<dyn AuthorizationCodeSource>,
    ) -> Result<Self> {
        let oauth = secret.oauth2_client()?;
        // Token endpoints must not be followed through redirects.
        let http = oauth2::reqwest::Client::builder()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| GcloudError::AuthorizationFlow(format!("OAuth2 HTTP client: {e}")))?;

        Ok(Self {
            secret,
            oauth,
            http,
            scopes,
            lock: FileLock::beside(&token_path),
            token_path,
            code_source,
            token: RwLock::new(None),
        })
    }

    pub fn token_path(&self) -> &Path {
        &self.token_path
    }

    /// Consent URL requesting offline access, forcing account selection.
    pub fn authorization_url(&self) -> (String, CsrfToken) {
        let (url, csrf) = self
            .oauth
            .authorize_url(CsrfToken::new_random)
            .add_scopes(self.scopes.iter().cloned().map(Scope::new))
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "select_account consent")
            .url();
        (url.to_string(), csrf)
    }

    /// Load the persisted token, if any.
    pub async fn load_token(&self) -> Result<Option<StoredToken>> {
        if !self.token_path.exists() {
            return Ok(None);
        }
        let data = tokio::fs::read_to_string(&self.token_path).await.map_err(|e| {
            GcloudError::Credential(format!(
                "Failed to read token file {}: {e}",
                self.token_path.display()
            ))
        })?;
        let token: StoredToken = serde_json::from_str(&data).map_err(|e| {
            GcloudError::Credential(format!(
                "Malformed token file {}: {e}",
                self.token_path.display()
            ))
        })?;
        Ok(Some(token))
    }

    fn save_token(&self, token: &StoredToken) -> Result<()> {
        let data = serde_json::to_vec_pretty(token)?;
        fileops::write_atomic(&self.token_path, &data, 0o600)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<StoredToken> {
        info!(client_id = %self.secret.client_id, "refreshing Drive access token");
        let resp = self
            .oauth
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| GcloudError::AuthorizationFlow(format!("Token refresh failed: {e}")))?;
        Ok(StoredToken::from_response(
            &resp,
            Some(refresh_token.to_string()),
        ))
    }

    async fn exchange_interactively(&self) -> Result<StoredToken> {
        let (url, _csrf) = self.authorization_url();
        info!(token_path = %self.token_path.display(), "no usable Drive token; requesting authorization");
        let code = self
            .code_source
            .authorization_code(&url)
            .await
            .map_err(|e| match e {
                GcloudError::AuthorizationFlow(msg) => GcloudError::AuthorizationFlow(format!(
                    "{msg} (token file: {})",
                    self.token_path.display()
                )),
                other => other,
            })?;
        if code.is_empty() {
            return Err(GcloudError::AuthorizationFlow(
                "Empty authorization code".into(),
            ));
        }
        let resp = self
            .oauth
            .exchange_code(AuthorizationCode::new(code))
            .request_async(&self.http)
            .await
            .map_err(|e| GcloudError::AuthorizationFlow(format!("Token exchange failed: {e}")))?;
        Ok(StoredToken::from_response(&resp, None))
    }

    /// Slow path: under the file lock, reuse a token another process wrote,
    /// else refresh, else run the authorization-code flow; persist the result.
    async fn renew(&self) -> Result<StoredToken> {
        if let Some(dir) = self.token_path.parent() {
            fileops::create_private_dir(dir)?;
        }
        let _guard = self.lock.acquire_timeout(LOCK_TIMEOUT).await?;

        let stored = self.load_token().await?;
        if let Some(token) = stored.as_ref().filter(|t| !t.is_expired()) {
            return Ok(token.clone());
        }

        let renewed = match stored.and_then(|t| t.refresh_token) {
            Some(refresh_token) => match self.refresh(&refresh_token).await {
                Ok(token) => token,
                Err(e) => {
                    warn!(error = %e, "refresh failed; falling back to authorization flow");
                    self.exchange_interactively().await?
                }
            },
            None => self.exchange_interactively().await?,
        };

        self.save_token(&renewed)?;
        info!(token_path = %self.token_path.display(), "saved Drive token");
        Ok(renewed)
    }
}

#[async_trait]
impl TokenProvider for InstalledAppTokenProvider {
    async fn access_token(&self) -> Result<String> {
        if let Some(token) = self.token.read().await.as_ref() {
            if !token.is_expired() {
                return Ok(token.access_token.clone());
            }
        }

        let mut guard = self.token.write().await;
        if let Some(token) = guard.as_ref() {
            if !token.is_expired() {
                return Ok(token.access_token.clone());
            }
        }
        let token = self.renew().await?;
        let access = token.access_token.clone();
        *guard = Some(token);
        Ok(access)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
