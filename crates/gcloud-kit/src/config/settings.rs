use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{GcloudError, Result};

pub const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";

/// Pub/Sub connection settings.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PubSubSettings {
    /// Service account JSON key file.
    pub key_file: PathBuf,
    pub project_id: String,
    /// Base URL override, e.g. `http://localhost:8085` for the emulator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Cloud Storage connection settings.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageSettings {
    /// Service account JSON key file. Also supplies the signing key for
    /// signed URLs.
    pub key_file: PathBuf,
    /// Default bucket for every operation.
    pub bucket: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Cloud Tasks connection settings. Project, location and queue are given per
/// call.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TasksSettings {
    pub key_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Google Drive connection settings (installed-app OAuth2).
#[derive(Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DriveSettings {
    /// Sent as the `User-Agent` of every Drive request.
    pub app_name: String,
    /// OAuth2 client secret JSON (`installed` or `web` section).
    pub credentials_path: PathBuf,
    /// Where the access/refresh token pair is persisted.
    pub token_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default = "default_drive_scopes")]
    pub scopes: Vec<String>,
}

fn default_drive_scopes() -> Vec<String> {
    vec![DRIVE_SCOPE.to_string()]
}

/// Transport tuning shared by every backend's `reqwest::Client`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpSettings {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub pool_idle_timeout_secs: u64,
    pub pool_max_idle_per_host: usize,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            connect_timeout_secs: 10,
            pool_idle_timeout_secs: 90,
            pool_max_idle_per_host: 100,
        }
    }
}

impl PubSubSettings {
    pub fn new(key_file: impl Into<PathBuf>, project_id: impl Into<String>) -> Self {
        Self {
            key_file: key_file.into(),
            project_id: project_id.into(),
            endpoint: None,
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

impl StorageSettings {
    pub fn new(key_file: impl Into<PathBuf>, bucket: impl Into<String>) -> Self {
        Self {
            key_file: key_file.into(),
            bucket: bucket.into(),
            endpoint: None,
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

impl TasksSettings {
    pub fn new(key_file: impl Into<PathBuf>) -> Self {
        Self {
            key_file: key_file.into(),
            endpoint: None,
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

impl DriveSettings {
    pub fn new(
        app_name: impl Into<String>,
        credentials_path: impl Into<PathBuf>,
        token_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            app_name: app_name.into(),
            credentials_path: credentials_path.into(),
            token_path: token_path.into(),
            endpoint: None,
            scopes: default_drive_scopes(),
        }
    }

    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

// Credential locations are redacted from Debug output.
fn redacted(_: &Path) -> &'static str {
    "[REDACTED]"
}

impl std::fmt::Debug for PubSubSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubSettings")
            .field("key_file", &redacted(&self.key_file))
            .field("project_id", &self.project_id)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl std::fmt::Debug for StorageSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageSettings")
            .field("key_file", &redacted(&self.key_file))
            .field("bucket", &self.bucket)
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl std::fmt::Debug for TasksSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TasksSettings")
            .field("key_file", &redacted(&self.key_file))
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl std::fmt::Debug for DriveSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriveSettings")
            .field("app_name", &self.app_name)
            .field("credentials_path", &redacted(&self.credentials_path))
            .field("token_path", &redacted(&self.token_path))
            .field("endpoint", &self.endpoint)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Per-backend configuration, constructed once and handed to each client.
///
/// A backend whose section is `None` is "not configured": every operation on
/// it fails with [`GcloudError::Config`] before touching the network.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pubsub: Option<PubSubSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<TasksSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive: Option<DriveSettings>,
    #[serde(default)]
    pub http: HttpSettings,
}

impl CloudConfig {
    #[must_use]
    pub fn with_pubsub(mut self, settings: PubSubSettings) -> Self {
        self.pubsub = Some(settings);
        self
    }

    #[must_use]
    pub fn with_storage(mut self, settings: StorageSettings) -> Self {
        self.storage = Some(settings);
        self
    }

    #[must_use]
    pub fn with_tasks(mut self, settings: TasksSettings) -> Self {
        self.tasks = Some(settings);
        self
    }

    #[must_use]
    pub fn with_drive(mut self, settings: DriveSettings) -> Self {
        self.drive = Some(settings);
        self
    }

    #[must_use]
    pub fn with_http(mut self, settings: HttpSettings) -> Self {
        self.http = settings;
        self
    }

    pub fn require_pubsub(&self) -> Result<&PubSubSettings> {
        self.pubsub.as_ref().ok_or_else(|| not_configured("pubsub"))
    }

    pub fn require_storage(&self) -> Result<&StorageSettings> {
        self.storage.as_ref().ok_or_else(|| not_configured("storage"))
    }

    pub fn require_tasks(&self) -> Result<&TasksSettings> {
        self.tasks.as_ref().ok_or_else(|| not_configured("tasks"))
    }

    pub fn require_drive(&self) -> Result<&DriveSettings> {
        self.drive.as_ref().ok_or_else(|| not_configured("drive"))
    }

    /// Load configuration from a camelCase JSON file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
            GcloudError::Config(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        serde_json::from_str(&contents).map_err(|e| {
            GcloudError::Config(format!("Failed to parse config file {}: {e}", path.display()))
        })
    }
}

pub(crate) fn not_configured(backend: &str) -> GcloudError {
    GcloudError::Config(format!(
        "{backend} is not configured; set its settings before use"
    ))
}
