//! Google Drive client over the v3 REST API.
//!
//! Authenticates as a user through installed-app OAuth2 with a persisted
//! token file (see [`InstalledAppTokenProvider`]). Searches return plain
//! `Vec`s and treat a not-found response as "no matches"; mutations propagate
//! every error.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::auth::{
    AuthorizationCodeSource, ClientSecret, InstalledAppTokenProvider, NonInteractive,
    TokenProvider,
};
use crate::cloud::drive_query::{DriveQuery, FOLDER_MIME_TYPE};
use crate::cloud::CloudClient;
use crate::config::settings::not_configured;
use crate::config::{CloudConfig, DriveSettings};
use crate::connector::{is_dot_segment, Connection, ConnectionSlot};
use crate::errors::{GcloudError, Result};
use crate::http_client::HttpClient;

const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
const SERVICE: &str = "drive";
const SEARCH_FIELDS: &str = "nextPageToken, files(id, name)";
const FILE_FIELDS: &str = "id, name, mimeType, parents, appProperties";
const DEFAULT_PAGE_SIZE: u32 = 10;
const PROPERTY_PAGE_SIZE: u32 = 100;

// ---------------------------------------------------------------------------
// Data models
// ---------------------------------------------------------------------------

/// A search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveRecord {
    pub name: String,
    pub id: String,
}

/// File metadata for by-id lookups and moves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    #[serde(default)]
    pub parents: Vec<String>,
    #[serde(default)]
    pub app_properties: HashMap<String, String>,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }
}

#[derive(Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveRecord>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct FolderMetadata<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parents: Option<Vec<&'a str>>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    app_properties: &'a HashMap<String, String>,
}

#[derive(Deserialize)]
struct CreatedId {
    id: String,
}

fn require_id<'a>(what: &str, id: &'a str) -> Result<&'a str> {
    if id.trim().is_empty() {
        return Err(GcloudError::InvalidArgument(format!("Empty {what}")));
    }
    if is_dot_segment(id) {
        return Err(GcloudError::InvalidArgument(format!("Invalid {what}: {id:?}")));
    }
    Ok(id)
}

// ---------------------------------------------------------------------------
// DriveClient
// ---------------------------------------------------------------------------

pub struct DriveClient {
    settings: Option<DriveSettings>,
    http: HttpClient,
    token_override: Option<Arc<dyn TokenProvider>>,
    code_source: Arc<dyn AuthorizationCodeSource>,
    conn: ConnectionSlot,
}

impl DriveClient {
    /// Interactive authorization is disabled until a code source is set with
    /// [`DriveClient::with_code_source`].
    pub fn new(config: &CloudConfig, http: HttpClient) -> Self {
        Self {
            settings: config.drive.clone(),
            http,
            token_override: None,
            code_source: Arc::new(NonInteractive),
            conn: ConnectionSlot::new(),
        }
    }

    #[must_use]
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_override = Some(provider);
        self
    }

    /// How to obtain an authorization code when no usable token is stored,
    /// e.g. [`crate::auth::ConsolePrompt`].
    #[must_use]
    pub fn with_code_source(mut self, source: Arc<dyn AuthorizationCodeSource>) -> Self {
        self.code_source = source;
        self
    }

    fn settings(&self) -> Result<&DriveSettings> {
        self.settings.as_ref().ok_or_else(|| not_configured(SERVICE))
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        let settings = self.settings()?;
        self.conn
            .get_or_try_init(|| async move {
                let base = settings.endpoint.as_deref().unwrap_or(DRIVE_API_BASE);
                let provider: Arc<dyn TokenProvider> = match &self.token_override {
                    Some(provider) => provider.clone(),
                    None => {
                        let secret = ClientSecret::from_file(&settings.credentials_path).await?;
                        let provider = InstalledAppTokenProvider::new(
                            secret,
                            settings.scopes.clone(),
                            settings.token_path.clone(),
                            self.code_source.clone(),
                        )?;
                        // Surface authorization problems at connect time.
                        provider.access_token().await?;
                        Arc::new(provider)
                    }
                };
                let http = self.http.get_client().await;
                let conn = Connection::new(SERVICE, base, http, provider)?
                    .with_user_agent(settings.app_name.clone());
                info!(app = %settings.app_name, endpoint = base, "drive connected");
                Ok(conn)
            })
            .await
    }

    async fn search(
        &self,
        query: &DriveQuery,
        page_size: u32,
        what: &str,
    ) -> Result<Vec<DriveRecord>> {
        self.settings()?;
        let q = query.build()?;
        let conn = self.connection().await?;

        let page_size = page_size.to_string();
        let req = conn
            .request(Method::GET, conn.url(["files"])?)
            .await?
            .query(&[
                ("q", q.as_str()),
                ("spaces", "drive"),
                ("fields", SEARCH_FIELDS),
                ("pageSize", page_size.as_str()),
            ]);
        match conn.json::<FileList>(req, what).await {
            Ok(list) => Ok(list.files),
            Err(e) if e.is_not_found() => {
                warn!(query = %q, "drive search returned not found; treating as no matches");
                Ok(Vec::new())
            }
            Err(e) => Err(e),
        }
    }

    /// Folders named exactly `name`, optionally under `parent`.
    pub async fn find_folders_by_name(
        &self,
        name: &str,
        parent: Option<&str>,
        page_size: Option<u32>,
    ) -> Result<Vec<DriveRecord>> {
        let mut query = DriveQuery::new().folders_only().name_eq(name);
        if let Some(parent) = parent {
            query = query.in_parents(parent);
        }
        self.search(&query, page_size.unwrap_or(DEFAULT_PAGE_SIZE), name)
            .await
    }

    /// Folders carrying the app property `key = value`.
    pub async fn find_folders_by_property(
        &self,
        key: &str,
        value: &str,
        parent: Option<&str>,
        page_size: Option<u32>,
    ) -> Result<Vec<DriveRecord>> {
        let mut query = DriveQuery::new().folders_only().app_property(key, value);
        if let Some(parent) = parent {
            query = query.in_parents(parent);
        }
        self.search(&query, page_size.unwrap_or(PROPERTY_PAGE_SIZE), key)
            .await
    }

    /// Direct children of `folder_id`, optionally of one MIME type.
    pub async fn list_files_in_folder(
        &self,
        folder_id: &str,
        mime_type: Option<&str>,
        page_size: Option<u32>,
    ) -> Result<Vec<DriveRecord>> {
        self.settings()?;
        let folder_id = require_id("folder id", folder_id)?;
        let mut query = DriveQuery::new().in_parents(folder_id);
        if let Some(mime_type) = mime_type {
            query = query.mime_type_eq(mime_type);
        }
        self.search(&query, page_size.unwrap_or(DEFAULT_PAGE_SIZE), folder_id)
            .await
    }

    /// Files named exactly `name`, narrowed by `extra` when given.
    pub async fn find_files_by_name(
        &self,
        name: &str,
        extra: Option<&DriveQuery>,
        page_size: Option<u32>,
    ) -> Result<Vec<DriveRecord>> {
        let mut query = DriveQuery::new().name_eq(name);
        if let Some(extra) = extra {
            query = query.and(extra.clone());
        }
        self.search(&query, page_size.unwrap_or(DEFAULT_PAGE_SIZE), name)
            .await
    }

    pub async fn find_files_by_query(
        &self,
        query: &DriveQuery,
        page_size: Option<u32>,
    ) -> Result<Vec<DriveRecord>> {
        self.search(query, page_size.unwrap_or(DEFAULT_PAGE_SIZE), "query")
            .await
    }

    /// Metadata of `file_id`, or `None` if it does not exist.
    pub async fn get_file_by_id(&self, file_id: &str) -> Result<Option<DriveFile>> {
        self.settings()?;
        let file_id = require_id("file id", file_id)?;
        match self.file_metadata(file_id).await {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn file_metadata(&self, file_id: &str) -> Result<DriveFile> {
        let conn = self.connection().await?;
        let req = conn
            .request(Method::GET, conn.url(["files", file_id])?)
            .await?
            .query(&[("fields", FILE_FIELDS)]);
        conn.json(req, file_id).await
    }

    /// Create a folder and return its id.
    pub async fn create_folder(
        &self,
        name: &str,
        parent: Option<&str>,
        app_properties: &HashMap<String, String>,
    ) -> Result<String> {
        self.settings()?;
        let name = require_id("folder name", name)?;
        let conn = self.connection().await?;

        let body = FolderMetadata {
            name,
            mime_type: Some(FOLDER_MIME_TYPE),
            parents: parent.map(|p| vec![p]),
            app_properties,
        };
        let req = conn
            .request(Method::POST, conn.url(["files"])?)
            .await?
            .query(&[("fields", "id")])
            .json(&body);
        let created: CreatedId = conn.json(req, name).await?;
        info!(folder = name, id = %created.id, "created drive folder");
        Ok(created.id)
    }

    /// Rename a folder and merge `app_properties` into its metadata.
    pub async fn update_folder(
        &self,
        folder_id: &str,
        name: &str,
        app_properties: &HashMap<String, String>,
    ) -> Result<String> {
        self.settings()?;
        let folder_id = require_id("folder id", folder_id)?;
        let name = require_id("folder name", name)?;
        let conn = self.connection().await?;

        let body = FolderMetadata {
            name,
            mime_type: None,
            parents: None,
            app_properties,
        };
        let req = conn
            .request(Method::PATCH, conn.url(["files", folder_id])?)
            .await?
            .query(&[("fields", "id")])
            .json(&body);
        let updated: CreatedId = conn.json(req, folder_id).await?;
        Ok(updated.id)
    }

    /// Move `file_id` so that `destination` becomes its only parent.
    pub async fn move_file(&self, file_id: &str, destination: &str) -> Result<DriveFile> {
        self.settings()?;
        let file_id = require_id("file id", file_id)?;
        let destination = require_id("destination folder id", destination)?;

        let current = self.file_metadata(file_id).await?;
        let remove = current
            .parents
            .iter()
            .filter(|p| p.as_str() != destination)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(",");

        let conn = self.connection().await?;
        let req = conn
            .request(Method::PATCH, conn.url(["files", file_id])?)
            .await?
            .query(&[
                ("addParents", destination),
                ("removeParents", remove.as_str()),
                ("fields", FILE_FIELDS),
            ])
            .json(&serde_json::json!({}));
        let moved: DriveFile = conn.json(req, file_id).await?;
        info!(file = file_id, to = destination, "moved drive file");
        Ok(moved)
    }

    /// Permanently delete `file_id` (bypasses the trash).
    pub async fn delete_file(&self, file_id: &str) -> Result<()> {
        self.settings()?;
        let file_id = require_id("file id", file_id)?;
        let conn = self.connection().await?;

        let req = conn
            .request(Method::DELETE, conn.url(["files", file_id])?)
            .await?;
        conn.send(req, file_id).await?;
        info!(file = file_id, "deleted drive file");
        Ok(())
    }

    /// Content of a binary file. Google Docs formats need an export instead.
    pub async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        self.settings()?;
        let file_id = require_id("file id", file_id)?;
        let conn = self.connection().await?;

        let req = conn
            .request(Method::GET, conn.url(["files", file_id])?)
            .await?
            .query(&[("alt", "media")]);
        conn.bytes(req, file_id).await
    }
}

#[async_trait]
impl CloudClient for DriveClient {
    fn name(&self) -> &str {
        "Google Drive"
    }

    async fn connect(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    async fn close(&self) {
        if self.conn.close().await {
            info!("drive connection closed");
        }
    }

    async fn is_connected(&self) -> bool {
        self.conn.is_open().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
