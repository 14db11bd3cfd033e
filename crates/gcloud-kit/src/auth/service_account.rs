use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{TokenProvider, GOOGLE_TOKEN_URL};
use crate::crypto::RsaSigner;
use crate::errors::{GcloudError, Result};

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;
const EXPIRY_LEEWAY_SECS: i64 = 60;

fn default_token_uri() -> String {
    GOOGLE_TOKEN_URL.to_string()
}

/// The fields of a service account JSON key file this crate uses.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type", default)]
    pub key_type: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub private_key_id: Option<String>,
    pub private_key: String,
    pub client_email: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("project_id", &self.project_id)
            .field("client_email", &self.client_email)
            .field("private_key", &"[REDACTED]")
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

impl ServiceAccountKey {
    pub async fn from_file(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "loading service account key");
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            GcloudError::Credential(format!(
                "Failed to read key file {}: {e}",
                path.display()
            ))
        })?;
        Self::from_json(&contents)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let key: Self = serde_json::from_str(json)
            .map_err(|e| GcloudError::Credential(format!("Malformed service account key: {e}")))?;
        if let Some(kind) = key.key_type.as_deref() {
            if kind != "service_account" {
                return Err(GcloudError::Credential(format!(
                    "Expected a service_account key, got '{kind}'"
                )));
            }
        }
        Ok(key)
    }

    pub fn signer(&self) -> Result<RsaSigner> {
        RsaSigner::from_pem(&self.private_key)
    }
}

#[derive(Serialize)]
struct JwtHeader<'a> {
    alg: &'static str,
    typ: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    kid: Option<&'a str>,
}

#[derive(Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

struct CachedToken {
    token: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        now + Duration::seconds(EXPIRY_LEEWAY_SECS) < self.expires_at
    }
}

/// Exchanges self-signed JWT assertions for access tokens and caches them
/// until shortly before expiry.
pub struct ServiceAccountTokenProvider {
    key: Arc<ServiceAccountKey>,
    signer: RsaSigner,
    scope: String,
    http: reqwest::Client,
    cached: RwLock<Option<CachedToken>>,
}

impl ServiceAccountTokenProvider {
    pub fn new(key: Arc<ServiceAccountKey>, scopes: &[&str], http: reqwest::Client) -> Result<Self> {
        let signer = key.signer()?;
        Ok(Self {
            key,
            signer,
            scope: scopes.join(" "),
            http,
            cached: RwLock::new(None),
        })
    }

    pub fn key(&self) -> &Arc<ServiceAccountKey> {
        &self.key
    }

    /// Build the signed `header.claims.signature` assertion.
    fn assertion(&self, now: DateTime<Utc>) -> Result<String> {
        let header = JwtHeader {
            alg: "RS256",
            typ: "JWT",
            kid: self.key.private_key_id.as_deref(),
        };
        let iat = now.timestamp();
        let claims = JwtClaims {
            iss: &self.key.client_email,
            scope: &self.scope,
            aud: &self.key.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };

        let signing_input = format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&header)?),
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?)
        );
        let signature = self.signer.sign(signing_input.as_bytes())?;
        Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(signature)))
    }

    async fn fetch(&self) -> Result<CachedToken> {
        let now = Utc::now();
        let assertion = self.assertion(now)?;

        let resp = self
            .http
            .post(&self.key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(GcloudError::Http)?;

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(match status {
                400 | 401 => GcloudError::Credential(format!(
                    "Token exchange for {} rejected ({status}): {body}",
                    self.key.client_email
                )),
                _ => GcloudError::from_response("oauth2", &self.key.token_uri, status, &body),
            });
        }

        let token: TokenResponse = resp.json().await.map_err(GcloudError::Http)?;
        let lifetime = token.expires_in.unwrap_or(ASSERTION_LIFETIME_SECS);
        debug!(
            client_email = %self.key.client_email,
            expires_in = lifetime,
            "obtained service account access token"
        );
        Ok(CachedToken {
            token: token.access_token,
            expires_at: now + Duration::seconds(lifetime),
        })
    }
}

#[async_trait]
impl TokenProvider for ServiceAccountTokenProvider {
    async fn access_token(&self) -> Result<String> {
        if let Some(cached) = self.cached.read().await.as_ref() {
            if cached.is_fresh(Utc::now()) {
                return Ok(cached.token.clone());
            }
        }

        let mut guard = self.cached.write().await;
        // Another task may have refreshed while we waited for the write lock.
        if let Some(cached) = guard.as_ref() {
            if cached.is_fresh(Utc::now()) {
                return Ok(cached.token.clone());
            }
        }
        let fresh = self.fetch().await?;
        let token = fresh.token.clone();
        *guard = Some(fresh);
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use ring::signature::{UnparsedPublicKey, RSA_PKCS1_2048_8192_SHA256};

    use super::*;
    use crate::auth::CLOUD_PLATFORM_SCOPE;
    use crate::crypto::tests::FIXTURE_KEY;

    fn fixture_key(token_uri: Option<&str>) -> Arc<ServiceAccountKey> {
        let mut key = ServiceAccountKey::from_json(FIXTURE_KEY).unwrap();
        if let Some(uri) = token_uri {
            key.token_uri = uri.to_string();
        }
        Arc::new(key)
    }

    #[test]
    fn test_parse_fixture_key() {
        let key = fixture_key(None);
        assert_eq!(key.client_email, "fixture@fixture-project.iam.gserviceaccount.com");
        assert_eq!(key.project_id.as_deref(), Some("fixture-project"));
        assert_eq!(key.token_uri, GOOGLE_TOKEN_URL);
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let debug = format!("{:?}", fixture_key(None));
        assert!(!debug.contains("BEGIN PRIVATE KEY"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn test_malformed_and_wrong_type_keys() {
        assert!(matches!(
            ServiceAccountKey::from_json("{}"),
            Err(GcloudError::Credential(_))
        ));
        let authorized_user = r#"{"type":"authorized_user","private_key":"x","client_email":"y"}"#;
        assert!(matches!(
            ServiceAccountKey::from_json(authorized_user),
            Err(GcloudError::Credential(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_key_file_is_credential_error() {
        let err = ServiceAccountKey::from_file(Path::new("/nonexistent/key.json"))
            .await
            .unwrap_err();
        match err {
            GcloudError::Credential(msg) => assert!(msg.contains("/nonexistent/key.json")),
            other => panic!("Expected Credential, got: {:?}", other),
        }
    }

    #[test]
    fn test_assertion_claims_and_signature() {
        let provider = ServiceAccountTokenProvider::new(
            fixture_key(None),
            &[CLOUD_PLATFORM_SCOPE],
            reqwest::Client::new(),
        )
        .unwrap();
        let now = Utc::now();
        let jwt = provider.assertion(now).unwrap();

        let parts: Vec<&str> = jwt.split('.').collect();
        assert_eq!(parts.len(), 3);

        let header: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[0]).unwrap()).unwrap();
        assert_eq!(header["alg"], "RS256");
        assert_eq!(header["kid"], "0123456789abcdef");

        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(parts[1]).unwrap()).unwrap();
        assert_eq!(claims["iss"], "fixture@fixture-project.iam.gserviceaccount.com");
        assert_eq!(claims["aud"], GOOGLE_TOKEN_URL);
        assert_eq!(claims["scope"], CLOUD_PLATFORM_SCOPE);
        assert_eq!(
            claims["exp"].as_i64().unwrap() - claims["iat"].as_i64().unwrap(),
            ASSERTION_LIFETIME_SECS
        );

        let public = provider.signer.public_key_der();
        let signature = URL_SAFE_NO_PAD.decode(parts[2]).unwrap();
        let signing_input = format!("{}.{}", parts[0], parts[1]);
        UnparsedPublicKey::new(&RSA_PKCS1_2048_8192_SHA256, &public)
            .verify(signing_input.as_bytes(), &signature)
            .unwrap();
    }

    #[tokio::test]
    async fn test_token_exchange_is_cached() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/token")
            .match_body(mockito::Matcher::UrlEncoded(
                "grant_type".into(),
                JWT_BEARER_GRANT.into(),
            ))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"access_token":"ya29.sa","expires_in":3599,"token_type":"Bearer"}"#)
            .expect(1)
            .create_async()
            .await;

        let token_uri = format!("{}/token", server.url());
        let provider = ServiceAccountTokenProvider::new(
            fixture_key(Some(&token_uri)),
            &[CLOUD_PLATFORM_SCOPE],
            reqwest::Client::new(),
        )
        .unwrap();

        assert_eq!(provider.access_token().await.unwrap(), "ya29.sa");
        assert_eq!(provider.access_token().await.unwrap(), "ya29.sa");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_rejected_grant_is_credential_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/token")
            .with_status(400)
            .with_body(r#"{"error":"invalid_grant","error_description":"Invalid JWT Signature."}"#)
            .create_async()
            .await;

        let token_uri = format!("{}/token", server.url());
        let provider = ServiceAccountTokenProvider::new(
            fixture_key(Some(&token_uri)),
            &[CLOUD_PLATFORM_SCOPE],
            reqwest::Client::new(),
        )
        .unwrap();

        let err = provider.access_token().await.unwrap_err();
        assert!(matches!(err, GcloudError::Credential(_)));
    }
}
