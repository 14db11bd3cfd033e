//! Cloud Tasks client: enqueue HTTP-target tasks via the v2 REST API.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::{Method, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::auth::{TokenProvider, CLOUD_PLATFORM_SCOPE};
use crate::cloud::CloudClient;
use crate::config::settings::not_configured;
use crate::config::{CloudConfig, TasksSettings};
use crate::connector::{Connection, ConnectionSlot};
use crate::errors::{GcloudError, Result};
use crate::http_client::HttpClient;

const TASKS_API_BASE: &str = "https://cloudtasks.googleapis.com";
const SERVICE: &str = "tasks";

/// HTTP method a task is dispatched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskHttpMethod {
    Get,
    Put,
    Delete,
    Post,
}

impl TaskHttpMethod {
    /// `"GET"`, `"PUT"` and `"DELETE"` (exact, case-sensitive) map to
    /// themselves; any other name is `POST`.
    pub fn from_name(name: &str) -> Self {
        match name {
            "GET" => Self::Get,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            _ => Self::Post,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Post => "POST",
        }
    }

    /// Whether a request body is sent with this method.
    pub fn carries_body(&self) -> bool {
        matches!(self, Self::Post | Self::Put)
    }
}

impl fmt::Display for TaskHttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The created task as reported by the service.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    /// `projects/{p}/locations/{l}/queues/{q}/tasks/{id}`
    pub name: String,
    #[serde(default)]
    pub schedule_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub create_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub dispatch_count: u32,
    #[serde(default)]
    pub http_request: Option<TaskHttpRequest>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskHttpRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub http_method: TaskHttpMethod,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    /// Base64-encoded body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

fn default_method() -> TaskHttpMethod {
    TaskHttpMethod::Post
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTaskRequest<'a> {
    task: NewTask<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewTask<'a> {
    http_request: &'a TaskHttpRequest,
}

fn is_empty_payload(payload: &Value) -> bool {
    match payload {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(s) => s.is_empty(),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// TasksClient
// ---------------------------------------------------------------------------

pub struct TasksClient {
    settings: Option<TasksSettings>,
    http: HttpClient,
    token_override: Option<Arc<dyn TokenProvider>>,
    conn: ConnectionSlot,
}

impl TasksClient {
    pub fn new(config: &CloudConfig, http: HttpClient) -> Self {
        Self {
            settings: config.tasks.clone(),
            http,
            token_override: None,
            conn: ConnectionSlot::new(),
        }
    }

    #[must_use]
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_override = Some(provider);
        self
    }

    fn settings(&self) -> Result<&TasksSettings> {
        self.settings.as_ref().ok_or_else(|| not_configured(SERVICE))
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        let settings = self.settings()?;
        self.conn
            .get_or_try_init(|| async move {
                let base = settings.endpoint.as_deref().unwrap_or(TASKS_API_BASE);
                let http = self.http.get_client().await;
                let conn = match &self.token_override {
                    Some(provider) => Connection::new(SERVICE, base, http, provider.clone())?,
                    None => {
                        Connection::with_service_account(
                            SERVICE,
                            base,
                            &settings.key_file,
                            &[CLOUD_PLATFORM_SCOPE],
                            http,
                        )
                        .await?
                    }
                };
                info!(endpoint = base, "tasks connected");
                Ok(conn)
            })
            .await
    }

    /// Enqueue a task that calls `target_url` with `method`.
    ///
    /// A non-empty `payload` is sent as a JSON body for POST and PUT; other
    /// methods never carry a body.
    pub async fn create_task(
        &self,
        project: &str,
        location: &str,
        queue: &str,
        target_url: &str,
        method: TaskHttpMethod,
        payload: Option<&Value>,
    ) -> Result<Task> {
        self.settings()?;
        for (what, value) in [("project", project), ("location", location), ("queue", queue)] {
            if value.trim().is_empty() || value.contains('/') {
                return Err(GcloudError::InvalidArgument(format!(
                    "Invalid {what}: {value:?}"
                )));
            }
        }
        let target = Url::parse(target_url).map_err(|e| {
            GcloudError::InvalidArgument(format!("Invalid target URL {target_url}: {e}"))
        })?;
        if !matches!(target.scheme(), "http" | "https") {
            return Err(GcloudError::InvalidArgument(format!(
                "Target URL must be http(s): {target_url}"
            )));
        }

        let mut request = TaskHttpRequest {
            url: target_url.to_string(),
            http_method: method,
            headers: HashMap::new(),
            body: None,
        };
        match payload.filter(|p| !is_empty_payload(p)) {
            Some(payload) if method.carries_body() => {
                request
                    .headers
                    .insert("Content-Type".into(), "application/json".into());
                request.body = Some(BASE64.encode(serde_json::to_vec(payload)?));
            }
            Some(_) => debug!(%method, "dropping payload for a method without a body"),
            None => {}
        }

        let conn = self.connection().await?;
        let url = conn.url([
            "v2", "projects", project, "locations", location, "queues", queue, "tasks",
        ])?;
        let queue_path = format!("projects/{project}/locations/{location}/queues/{queue}");
        let req = conn
            .request(Method::POST, url)
            .await?
            .json(&CreateTaskRequest {
                task: NewTask {
                    http_request: &request,
                },
            });
        let task: Task = conn.json(req, &queue_path).await?;
        info!(task = %task.name, %method, target = target_url, "created task");
        Ok(task)
    }
}

#[async_trait]
impl CloudClient for TasksClient {
    fn name(&self) -> &str {
        "Cloud Tasks"
    }

    async fn connect(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    async fn close(&self) {
        if self.conn.close().await {
            info!("tasks connection closed");
        }
    }

    async fn is_connected(&self) -> bool {
        self.conn.is_open().await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use mockito::Matcher;
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;
    use crate::auth::StaticToken;

    const TASK_PATH: &str = "/v2/projects/proj/locations/europe-west1/queues/mail/tasks";

    fn client(endpoint: &str) -> TasksClient {
        let config = CloudConfig::default()
            .with_tasks(TasksSettings::new("/unused/key.json").with_endpoint(endpoint));
        TasksClient::new(&config, HttpClient::from_defaults().unwrap())
            .with_token_provider(Arc::new(StaticToken::new("tok")))
    }

    fn created(method: &str) -> String {
        json!({
            "name": "projects/proj/locations/europe-west1/queues/mail/tasks/123",
            "scheduleTime": "2024-05-01T10:00:00Z",
            "createTime": "2024-05-01T10:00:00Z",
            "httpRequest": {"url": "https://example.com/hook", "httpMethod": method}
        })
        .to_string()
    }

    #[test]
    fn test_method_names() {
        assert_eq!(TaskHttpMethod::from_name("GET"), TaskHttpMethod::Get);
        assert_eq!(TaskHttpMethod::from_name("PUT"), TaskHttpMethod::Put);
        assert_eq!(TaskHttpMethod::from_name("DELETE"), TaskHttpMethod::Delete);
        assert_eq!(TaskHttpMethod::from_name("POST"), TaskHttpMethod::Post);
        assert_eq!(TaskHttpMethod::from_name("get"), TaskHttpMethod::Post);
        assert_eq!(TaskHttpMethod::from_name("PATCH"), TaskHttpMethod::Post);
        assert_eq!(TaskHttpMethod::from_name(""), TaskHttpMethod::Post);
        assert_eq!(TaskHttpMethod::Delete.to_string(), "DELETE");
    }

    proptest! {
        #[test]
        fn prop_unknown_names_map_to_post(name in ".*") {
            let method = TaskHttpMethod::from_name(&name);
            prop_assert_eq!(method.as_str() == name, name == "GET" || name == "PUT" || name == "DELETE" || name == "POST");
            if !["GET", "PUT", "DELETE"].contains(&name.as_str()) {
                prop_assert_eq!(method, TaskHttpMethod::Post);
            }
        }

        #[test]
        fn prop_known_names_round_trip(method in prop_oneof![
            Just(TaskHttpMethod::Get),
            Just(TaskHttpMethod::Put),
            Just(TaskHttpMethod::Delete),
            Just(TaskHttpMethod::Post),
        ]) {
            prop_assert_eq!(TaskHttpMethod::from_name(method.as_str()), method);
        }
    }

    #[tokio::test]
    async fn test_post_with_payload() {
        let mut server = mockito::Server::new_async().await;
        let payload = json!({"to": "a@example.com"});
        let mock = server
            .mock("POST", TASK_PATH)
            .match_header("authorization", "Bearer tok")
            .match_body(Matcher::Json(json!({
                "task": {"httpRequest": {
                    "url": "https://example.com/hook",
                    "httpMethod": "POST",
                    "headers": {"Content-Type": "application/json"},
                    "body": BASE64.encode(serde_json::to_vec(&payload).unwrap())
                }}
            })))
            .with_status(200)
            .with_body(created("POST"))
            .create_async()
            .await;

        let task = client(&server.url())
            .create_task(
                "proj",
                "europe-west1",
                "mail",
                "https://example.com/hook",
                TaskHttpMethod::from_name("anything"),
                Some(&payload),
            )
            .await
            .unwrap();
        assert!(task.name.ends_with("/tasks/123"));
        assert_eq!(
            task.http_request.map(|r| r.http_method),
            Some(TaskHttpMethod::Post)
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_drops_payload() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", TASK_PATH)
            .match_body(Matcher::Json(json!({
                "task": {"httpRequest": {
                    "url": "https://example.com/hook",
                    "httpMethod": "GET"
                }}
            })))
            .with_status(200)
            .with_body(created("GET"))
            .create_async()
            .await;

        client(&server.url())
            .create_task(
                "proj",
                "europe-west1",
                "mail",
                "https://example.com/hook",
                TaskHttpMethod::Get,
                Some(&json!({"ignored": true})),
            )
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_empty_payload_sends_no_body() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", TASK_PATH)
            .match_body(Matcher::Json(json!({
                "task": {"httpRequest": {
                    "url": "https://example.com/hook",
                    "httpMethod": "PUT"
                }}
            })))
            .with_status(200)
            .with_body(created("PUT"))
            .create_async()
            .await;

        client(&server.url())
            .create_task(
                "proj",
                "europe-west1",
                "mail",
                "https://example.com/hook",
                TaskHttpMethod::Put,
                Some(&json!({})),
            )
            .await
            .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_missing_queue_is_not_found() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", TASK_PATH)
            .with_status(404)
            .with_body(r#"{"error":{"code":404,"message":"Requested entity was not found."}}"#)
            .create_async()
            .await;

        let err = client(&server.url())
            .create_task(
                "proj",
                "europe-west1",
                "mail",
                "https://example.com/hook",
                TaskHttpMethod::Post,
                None,
            )
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected_before_io() {
        let c = client("http://127.0.0.1:9");
        for url in ["not a url", "ftp://example.com/x", "/relative/path"] {
            assert!(matches!(
                c.create_task("proj", "loc", "q", url, TaskHttpMethod::Post, None)
                    .await,
                Err(GcloudError::InvalidArgument(_))
            ));
        }
        assert!(matches!(
            c.create_task("", "loc", "q", "https://x.test", TaskHttpMethod::Post, None)
                .await,
            Err(GcloudError::InvalidArgument(_))
        ));
        assert!(!c.is_connected().await);
    }

    #[tokio::test]
    async fn test_unconfigured_fails_before_io() {
        let c = TasksClient::new(&CloudConfig::default(), HttpClient::from_defaults().unwrap());
        assert!(matches!(
            c.create_task(
                "proj",
                "loc",
                "q",
                "https://example.com",
                TaskHttpMethod::Post,
                None
            )
            .await,
            Err(GcloudError::Config(_))
        ));
        assert!(matches!(c.connect().await, Err(GcloudError::Config(_))));
    }
}
