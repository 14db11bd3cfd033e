//! Cloud Storage client over the JSON API, plus locally signed V4 URLs.
//!
//! Every operation works on the configured bucket (delete can target
//! another). Object paths are used as given, minus a leading `/`.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, Url};
use serde::{Deserialize, Deserializer};
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::auth::{ServiceAccountKey, TokenProvider};
use crate::cloud::CloudClient;
use crate::config::settings::not_configured;
use crate::config::{CloudConfig, StorageSettings};
use crate::connector::{is_dot_segment, Connection, ConnectionSlot};
use crate::crypto::{hex_encode, sha256_hex};
use crate::errors::{GcloudError, Result};
use crate::fileops;
use crate::http_client::HttpClient;
use crate::utils::duration::{parse_relative_duration, DEFAULT_RELATIVE_DURATION};

const STORAGE_API_BASE: &str = "https://storage.googleapis.com";
const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const SERVICE: &str = "storage";
const SIGNING_ALGORITHM: &str = "GOOG4-RSA-SHA256";
const MAX_SIGNED_URL_SECS: u64 = 7 * 24 * 3_600;

// ---------------------------------------------------------------------------
// Data models
// ---------------------------------------------------------------------------

/// Object metadata returned by uploads.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    pub bucket: String,
    pub name: String,
    #[serde(default, deserialize_with = "de_opt_u64_string")]
    pub size: Option<u64>,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub generation: Option<String>,
    #[serde(default)]
    pub media_link: Option<String>,
}

// The JSON API encodes int64 fields as strings.
fn de_opt_u64_string<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Option<u64>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Str(String),
        Num(u64),
    }
    match Option::<Raw>::deserialize(d)? {
        None => Ok(None),
        Some(Raw::Num(n)) => Ok(Some(n)),
        Some(Raw::Str(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

// ---------------------------------------------------------------------------
// StorageClient
// ---------------------------------------------------------------------------

pub struct StorageClient {
    settings: Option<StorageSettings>,
    http: HttpClient,
    token_override: Option<Arc<dyn TokenProvider>>,
    conn: ConnectionSlot,
}

impl StorageClient {
    pub fn new(config: &CloudConfig, http: HttpClient) -> Self {
        Self {
            settings: config.storage.clone(),
            http,
            token_override: None,
            conn: ConnectionSlot::new(),
        }
    }

    /// Authenticate with `provider` instead of the configured key file.
    /// Signed URLs still read the key file for the signing key.
    #[must_use]
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_override = Some(provider);
        self
    }

    fn settings(&self) -> Result<&StorageSettings> {
        self.settings.as_ref().ok_or_else(|| not_configured(SERVICE))
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        let settings = self.settings()?;
        self.conn
            .get_or_try_init(|| async move {
                let base = settings.endpoint.as_deref().unwrap_or(STORAGE_API_BASE);
                let http = self.http.get_client().await;
                let conn = match &self.token_override {
                    Some(provider) => Connection::new(SERVICE, base, http, provider.clone())?,
                    None => {
                        Connection::with_service_account(
                            SERVICE,
                            base,
                            &settings.key_file,
                            &[STORAGE_SCOPE],
                            http,
                        )
                        .await?
                    }
                };
                info!(bucket = %settings.bucket, endpoint = base, "storage connected");
                Ok(conn)
            })
            .await
    }

    async fn upload(
        &self,
        object: &str,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<StoredObject> {
        let bucket = &self.settings()?.bucket;
        let conn = self.connection().await?;

        let url = conn.url(["upload", "storage", "v1", "b", bucket.as_str(), "o"])?;
        let size = content.len();
        let req = conn
            .request(Method::POST, url)
            .await?
            .query(&[("uploadType", "media"), ("name", object)])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(content);
        let stored: StoredObject = conn.json(req, object).await?;
        info!(bucket = %bucket, object, size, "uploaded object");
        Ok(stored)
    }

    /// Create an empty placeholder object `path/`. Returns the object name.
    pub async fn create_folder(&self, path: &str) -> Result<String> {
        self.settings()?;
        let mut object = object_name(path)?.to_string();
        if !object.ends_with('/') {
            object.push('/');
        }
        let stored = self
            .upload(&object, Vec::new(), "application/x-directory")
            .await?;
        Ok(stored.name)
    }

    /// Upload `content` as the object `path`, replacing any existing object.
    pub async fn save_content(
        &self,
        content: impl Into<Vec<u8>>,
        path: &str,
    ) -> Result<StoredObject> {
        self.settings()?;
        let object = object_name(path)?;
        self.upload(object, content.into(), content_type_for(object))
            .await
    }

    /// Upload a local file as `directory/name`; `name` defaults to the
    /// local file name.
    pub async fn upload_file(
        &self,
        local: &Path,
        directory: Option<&str>,
        name: Option<&str>,
    ) -> Result<StoredObject> {
        self.settings()?;
        let file_name = match name {
            Some(n) => n.to_string(),
            None => local
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    GcloudError::InvalidArgument(format!(
                        "No file name in {}",
                        local.display()
                    ))
                })?,
        };
        let joined = match directory.map(|d| d.trim_matches('/')).filter(|d| !d.is_empty()) {
            Some(dir) => format!("{dir}/{file_name}"),
            None => file_name,
        };
        let object = object_name(&joined)?.to_string();

        let content = tokio::fs::read(local).await?;
        self.upload(&object, content, content_type_for(&object))
            .await
    }

    /// V4 signed GET URL valid for a relative duration such as `+30 minutes`
    /// (default `+1 hour`).
    pub async fn signed_url(&self, path: &str, expires: Option<&str>) -> Result<String> {
        self.settings()?;
        let expires = parse_relative_duration(expires.unwrap_or(DEFAULT_RELATIVE_DURATION))?;
        self.signed_url_for(path, expires).await
    }

    /// V4 signed GET URL valid for `expires` (1 second to 7 days).
    pub async fn signed_url_for(&self, path: &str, expires: Duration) -> Result<String> {
        self.signed_url_at(path, expires, Utc::now()).await
    }

    async fn signed_url_at(
        &self,
        path: &str,
        expires: Duration,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let settings = self.settings()?;
        let object = object_name(path)?;
        let secs = expires.as_secs();
        if !(1..=MAX_SIGNED_URL_SECS).contains(&secs) {
            return Err(GcloudError::InvalidArgument(format!(
                "Signed URL expiry must be between 1 second and 7 days, got {secs}s"
            )));
        }

        let conn = self.connection().await?;
        let key = match conn.signing_key() {
            Some(key) => key.clone(),
            None => Arc::new(ServiceAccountKey::from_file(&settings.key_file).await?),
        };
        sign_url(&key, conn.base_url(), &settings.bucket, object, secs, now)
    }

    /// Unsigned URL of a publicly readable object.
    pub fn public_url(&self, path: &str) -> Result<String> {
        let settings = self.settings()?;
        let object = object_name(path)?;
        let base = settings.endpoint.as_deref().unwrap_or(STORAGE_API_BASE);
        Ok(format!(
            "{}/{}/{}",
            base.trim_end_matches('/'),
            settings.bucket,
            uri_encode(object, true)
        ))
    }

    /// Download the object into memory.
    pub async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let bucket = &self.settings()?.bucket;
        let object = object_name(path)?;
        let conn = self.connection().await?;

        let url = conn.url(["storage", "v1", "b", bucket.as_str(), "o", object])?;
        let req = conn
            .request(Method::GET, url)
            .await?
            .query(&[("alt", "media")]);
        conn.bytes(req, object).await
    }

    /// Stream the object to `local`, creating parent directories. Returns the
    /// number of bytes written.
    pub async fn download(&self, path: &str, local: &Path) -> Result<u64> {
        let bucket = &self.settings()?.bucket;
        let object = object_name(path)?;
        let conn = self.connection().await?;

        let url = conn.url(["storage", "v1", "b", bucket.as_str(), "o", object])?;
        let req = conn
            .request(Method::GET, url)
            .await?
            .query(&[("alt", "media")]);
        let mut resp = conn.execute(req, object).await?;

        if let Some(parent) = local.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        // `local` only appears once the whole body has arrived.
        let part = fileops::temp_sibling(local);
        let written = match stream_to_file(&mut resp, &part).await {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(e);
            }
        };
        if let Err(e) = tokio::fs::rename(&part, local).await {
            let _ = tokio::fs::remove_file(&part).await;
            return Err(e.into());
        }

        info!(bucket = %bucket, object, local = %local.display(), bytes = written, "downloaded object");
        Ok(written)
    }

    /// Delete the object from the configured bucket, or from `bucket`.
    pub async fn delete(&self, path: &str, bucket: Option<&str>) -> Result<()> {
        let settings = self.settings()?;
        let bucket = bucket.unwrap_or(&settings.bucket);
        let object = object_name(path)?;
        let conn = self.connection().await?;

        let url = conn.url(["storage", "v1", "b", bucket, "o", object])?;
        let req = conn.request(Method::DELETE, url).await?;
        conn.send(req, object).await?;
        info!(bucket, object, "deleted object");
        Ok(())
    }
}

#[async_trait]
impl CloudClient for StorageClient {
    fn name(&self) -> &str {
        "Cloud Storage"
    }

    async fn connect(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    async fn close(&self) {
        if self.conn.close().await {
            info!("storage connection closed");
        }
    }

    async fn is_connected(&self) -> bool {
        self.conn.is_open().await
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn stream_to_file(resp: &mut reqwest::Response, path: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(path).await?;
    let mut written = 0u64;
    while let Some(chunk) = resp.chunk().await? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    Ok(written)
}

fn object_name(path: &str) -> Result<&str> {
    let name = path.trim_start_matches('/');
    if name.is_empty() {
        return Err(GcloudError::InvalidArgument("Empty object path".into()));
    }
    if is_dot_segment(name) {
        return Err(GcloudError::InvalidArgument(format!(
            "Object name {name:?} is not allowed"
        )));
    }
    Ok(name)
}

fn content_type_for(object: &str) -> &'static str {
    let ext = object
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "json" => "application/json",
        "txt" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "csv" => "text/csv",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// RFC 3986 percent-encoding of everything except unreserved characters
/// (and `/` when `keep_slash`).
fn uri_encode(input: &str, keep_slash: bool) -> String {
    let mut out = String::with_capacity(input.len());
    for b in input.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char)
            }
            b'/' if keep_slash => out.push('/'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

/// Build a `GOOG4-RSA-SHA256` signed GET URL for `bucket/object` on the host
/// of `base`.
fn sign_url(
    key: &ServiceAccountKey,
    base: &Url,
    bucket: &str,
    object: &str,
    expires_secs: u64,
    now: DateTime<Utc>,
) -> Result<String> {
    let host = match (base.host_str(), base.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => {
            return Err(GcloudError::Config(format!(
                "Storage endpoint {base} has no host"
            )))
        }
    };
    let datetime = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = now.format("%Y%m%d").to_string();
    let scope = format!("{date}/auto/storage/goog4_request");

    let mut params = BTreeMap::new();
    params.insert("X-Goog-Algorithm", SIGNING_ALGORITHM.to_string());
    params.insert("X-Goog-Credential", format!("{}/{scope}", key.client_email));
    params.insert("X-Goog-Date", datetime.clone());
    params.insert("X-Goog-Expires", expires_secs.to_string());
    params.insert("X-Goog-SignedHeaders", "host".to_string());
    let query = params
        .iter()
        .map(|(k, v)| format!("{}={}", uri_encode(k, false), uri_encode(v, false)))
        .collect::<Vec<_>>()
        .join("&");

    let resource = format!("/{}/{}", uri_encode(bucket, false), uri_encode(object, true));
    let canonical_request =
        format!("GET\n{resource}\n{query}\nhost:{host}\n\nhost\nUNSIGNED-PAYLOAD");
    let string_to_sign = format!(
        "{SIGNING_ALGORITHM}\n{datetime}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );
    let signature = hex_encode(&key.signer()?.sign(string_to_sign.as_bytes())?);

    Ok(format!(
        "{}://{host}{resource}?{query}&X-Goog-Signature={signature}",
        base.scheme()
    ))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
