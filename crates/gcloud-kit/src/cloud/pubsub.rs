//! Cloud Pub/Sub client over the v1 REST API.
//!
//! Topic and subscription management, publishing, and a single bounded pull.
//! Short names are expanded against the configured project
//! (`orders` → `projects/{project}/topics/orders`); fully-qualified names are
//! used as given.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::{TokenProvider, CLOUD_PLATFORM_SCOPE};
use crate::cloud::CloudClient;
use crate::config::settings::not_configured;
use crate::config::{CloudConfig, PubSubSettings};
use crate::connector::{Connection, ConnectionSlot};
use crate::errors::{GcloudError, Result};
use crate::http_client::HttpClient;

const PUBSUB_API_BASE: &str = "https://pubsub.googleapis.com";
const SERVICE: &str = "pubsub";
const DEFAULT_MAX_MESSAGES: u32 = 1000;

// ---------------------------------------------------------------------------
// Data models
// ---------------------------------------------------------------------------

/// A message to publish.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PubsubMessage {
    pub data: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub ordering_key: Option<String>,
}

impl PubsubMessage {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    /// Message whose data is `value` serialized as JSON.
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self::new(serde_json::to_vec(value)?))
    }

    #[must_use]
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_ordering_key(mut self, key: impl Into<String>) -> Self {
        self.ordering_key = Some(key.into());
        self
    }

    /// Pub/Sub rejects messages with neither data nor attributes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() && self.attributes.is_empty()
    }
}

/// A message received by [`PubSubClient::pull`].
#[derive(Debug, Clone, PartialEq)]
pub struct PulledMessage {
    /// Decoded message data.
    pub message: Vec<u8>,
    pub attributes: HashMap<String, String>,
    pub message_id: String,
    /// Handle for acknowledging the message; this crate never acknowledges.
    pub ack_id: String,
    pub publish_time: Option<DateTime<Utc>>,
}

impl PulledMessage {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.message)?)
    }

    /// Message data as UTF-8, if it is valid UTF-8.
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.message).ok()
    }
}

#[derive(Serialize)]
struct WireMessage<'a> {
    data: String,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    attributes: &'a HashMap<String, String>,
    #[serde(rename = "orderingKey", skip_serializing_if = "Option::is_none")]
    ordering_key: Option<&'a str>,
}

#[derive(Serialize)]
struct PublishRequest<'a> {
    messages: Vec<WireMessage<'a>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[derive(Deserialize)]
struct NamedResource {
    #[serde(default)]
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TopicList {
    #[serde(default)]
    topics: Vec<NamedResource>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubscriptionList {
    #[serde(default)]
    subscriptions: Vec<NamedResource>,
    next_page_token: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PullRequest {
    max_messages: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PullResponse {
    #[serde(default)]
    received_messages: Vec<ReceivedMessage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedMessage {
    ack_id: String,
    message: ReceivedPayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceivedPayload {
    #[serde(default)]
    data: String,
    #[serde(default)]
    attributes: HashMap<String, String>,
    #[serde(default)]
    message_id: String,
    #[serde(default)]
    publish_time: Option<DateTime<Utc>>,
}

// ---------------------------------------------------------------------------
// PubSubClient
// ---------------------------------------------------------------------------

pub struct PubSubClient {
    settings: Option<PubSubSettings>,
    http: HttpClient,
    token_override: Option<Arc<dyn TokenProvider>>,
    conn: ConnectionSlot,
}

impl PubSubClient {
    pub fn new(config: &CloudConfig, http: HttpClient) -> Self {
        Self {
            settings: config.pubsub.clone(),
            http,
            token_override: None,
            conn: ConnectionSlot::new(),
        }
    }

    /// Authenticate with `provider` instead of the configured key file.
    #[must_use]
    pub fn with_token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_override = Some(provider);
        self
    }

    fn settings(&self) -> Result<&PubSubSettings> {
        self.settings.as_ref().ok_or_else(|| not_configured(SERVICE))
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        let settings = self.settings()?;
        self.conn
            .get_or_try_init(|| async move {
                let base = settings.endpoint.as_deref().unwrap_or(PUBSUB_API_BASE);
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
                info!(project = %settings.project_id, endpoint = base, "pubsub connected");
                Ok(conn)
            })
            .await
    }

    /// Fully-qualified topic name.
    pub fn topic_path(&self, topic: &str) -> Result<String> {
        self.resource_path("topics", topic)
    }

    /// Fully-qualified subscription name.
    pub fn subscription_path(&self, subscription: &str) -> Result<String> {
        self.resource_path("subscriptions", subscription)
    }

    fn resource_path(&self, kind: &str, name: &str) -> Result<String> {
        let settings = self.settings()?;
        if name.trim().is_empty() {
            return Err(GcloudError::InvalidArgument(format!(
                "Empty {kind} name"
            )));
        }
        if name.starts_with("projects/") {
            Ok(name.to_string())
        } else {
            Ok(format!("projects/{}/{kind}/{name}", settings.project_id))
        }
    }

    fn resource_url(conn: &Connection, path: &str) -> Result<reqwest::Url> {
        conn.url(std::iter::once("v1").chain(path.split('/')))
    }

    /// Create a topic and return its resource name.
    pub async fn create_topic(&self, topic: &str) -> Result<String> {
        let path = self.topic_path(topic)?;
        let conn = self.connection().await?;

        let req = conn
            .request(Method::PUT, Self::resource_url(&conn, &path)?)
            .await?
            .json(&serde_json::json!({}));
        let created: NamedResource = conn.json(req, &path).await?;
        non_empty_name(created, &path)
    }

    /// All topic names in the project, in server order.
    pub async fn list_topics(&self) -> Result<Vec<String>> {
        let project = format!("projects/{}/topics", self.settings()?.project_id);
        let conn = self.connection().await?;

        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut req = conn
                .request(Method::GET, Self::resource_url(&conn, &project)?)
                .await?;
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token)]);
            }
            let page: TopicList = conn.json(req, &project).await?;
            names.extend(page.topics.into_iter().map(|t| t.name));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(names)
    }

    /// Create a pull subscription on `topic`.
    pub async fn create_subscription(&self, subscription: &str, topic: &str) -> Result<String> {
        let path = self.subscription_path(subscription)?;
        let topic = self.topic_path(topic)?;
        let conn = self.connection().await?;

        let req = conn
            .request(Method::PUT, Self::resource_url(&conn, &path)?)
            .await?
            .json(&serde_json::json!({ "topic": topic }));
        let created: NamedResource = conn.json(req, &path).await?;
        non_empty_name(created, &path)
    }

    pub async fn list_subscriptions(&self) -> Result<Vec<String>> {
        let project = format!("projects/{}/subscriptions", self.settings()?.project_id);
        let conn = self.connection().await?;

        let mut names = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut req = conn
                .request(Method::GET, Self::resource_url(&conn, &project)?)
                .await?;
            if let Some(token) = &page_token {
                req = req.query(&[("pageToken", token)]);
            }
            let page: SubscriptionList = conn.json(req, &project).await?;
            names.extend(page.subscriptions.into_iter().map(|s| s.name));
            match page.next_page_token.filter(|t| !t.is_empty()) {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok(names)
    }

    /// Publish one message and return its server-assigned id.
    pub async fn publish(&self, topic: &str, message: PubsubMessage) -> Result<String> {
        let mut ids = self.publish_batch(topic, std::slice::from_ref(&message)).await?;
        ids.pop().ok_or_else(|| GcloudError::Remote {
            service: SERVICE.to_string(),
            status: 200,
            message: "publish returned no message id".into(),
        })
    }

    /// Publish `messages` in one request; ids are returned in message order.
    pub async fn publish_batch(
        &self,
        topic: &str,
        messages: &[PubsubMessage],
    ) -> Result<Vec<String>> {
        let path = self.topic_path(topic)?;
        if messages.is_empty() {
            return Err(GcloudError::InvalidArgument("Nothing to publish".into()));
        }
        if let Some(i) = messages.iter().position(PubsubMessage::is_empty) {
            return Err(GcloudError::InvalidArgument(format!(
                "Message {i} has neither data nor attributes"
            )));
        }
        let conn = self.connection().await?;

        let body = PublishRequest {
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    data: BASE64.encode(&m.data),
                    attributes: &m.attributes,
                    ordering_key: m.ordering_key.as_deref(),
                })
                .collect(),
        };
        let req = conn
            .request(Method::POST, Self::resource_url(&conn, &format!("{path}:publish"))?)
            .await?
            .json(&body);
        let resp: PublishResponse = conn.json(req, &path).await?;
        info!(topic = %path, count = resp.message_ids.len(), "published");
        Ok(resp.message_ids)
    }

    /// Pull up to `max_messages` (default 1000) in a single request.
    ///
    /// Messages are not acknowledged and will be redelivered after the
    /// subscription's ack deadline.
    pub async fn pull(
        &self,
        subscription: &str,
        max_messages: Option<u32>,
    ) -> Result<Vec<PulledMessage>> {
        let path = self.subscription_path(subscription)?;
        let max_messages = max_messages.unwrap_or(DEFAULT_MAX_MESSAGES);
        if max_messages == 0 {
            return Err(GcloudError::InvalidArgument(
                "max_messages must be positive".into(),
            ));
        }
        let conn = self.connection().await?;

        let req = conn
            .request(Method::POST, Self::resource_url(&conn, &format!("{path}:pull"))?)
            .await?
            .json(&PullRequest { max_messages });
        let resp: PullResponse = conn.json(req, &path).await?;

        resp.received_messages
            .into_iter()
            .map(|received| {
                let message = BASE64.decode(received.message.data.as_bytes()).map_err(|e| {
                    GcloudError::Remote {
                        service: SERVICE.to_string(),
                        status: 200,
                        message: format!("undecodable message data: {e}"),
                    }
                })?;
                Ok(PulledMessage {
                    message,
                    attributes: received.message.attributes,
                    message_id: received.message.message_id,
                    ack_id: received.ack_id,
                    publish_time: received.message.publish_time,
                })
            })
            .collect()
    }
}

fn non_empty_name(resource: NamedResource, path: &str) -> Result<String> {
    if resource.name.is_empty() {
        return Err(GcloudError::Remote {
            service: SERVICE.to_string(),
            status: 200,
            message: format!("no resource name returned for {path}"),
        });
    }
    Ok(resource.name)
}

#[async_trait]
impl CloudClient for PubSubClient {
    fn name(&self) -> &str {
        "Cloud Pub/Sub"
    }

    async fn connect(&self) -> Result<()> {
        self.connection().await.map(|_| ())
    }

    async fn close(&self) {
        if self.conn.close().await {
            info!("pubsub connection closed");
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
    use serde_json::json;
    use tempfile::TempDir;

    use super::*;
    use crate::auth::StaticToken;

    fn client(endpoint: &str) -> PubSubClient {
        let config = CloudConfig::default()
            .with_pubsub(PubSubSettings::new("/unused/key.json", "proj").with_endpoint(endpoint));
        PubSubClient::new(&config, HttpClient::from_defaults().unwrap())
            .with_token_provider(Arc::new(StaticToken::new("tok")))
    }

    #[test]
    fn test_resource_paths() {
        let c = client("http://localhost");
        assert_eq!(c.topic_path("orders").unwrap(), "projects/proj/topics/orders");
        assert_eq!(
            c.subscription_path("projects/other/subscriptions/s").unwrap(),
            "projects/other/subscriptions/s"
        );
        assert!(matches!(
            c.topic_path(" "),
            Err(GcloudError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_create_topic() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/v1/projects/proj/topics/orders")
            .match_header("authorization", "Bearer tok")
            .with_status(200)
            .with_body(r#"{"name":"projects/proj/topics/orders"}"#)
            .create_async()
            .await;

        let name = client(&server.url()).create_topic("orders").await.unwrap();
        assert_eq!(name, "projects/proj/topics/orders");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_create_topic_empty_name_is_remote_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/v1/projects/proj/topics/orders")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let err = client(&server.url()).create_topic("orders").await.unwrap_err();
        assert!(matches!(err, GcloudError::Remote { .. }));
    }

    #[tokio::test]
    async fn test_create_existing_topic_propagates_conflict() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("PUT", "/v1/projects/proj/topics/orders")
            .with_status(409)
            .with_body(r#"{"error":{"code":409,"message":"Resource already exists in the project"}}"#)
            .create_async()
            .await;

        match client(&server.url()).create_topic("orders").await.unwrap_err() {
            GcloudError::Remote { status, message, .. } => {
                assert_eq!(status, 409);
                assert!(message.contains("already exists"));
            }
            other => panic!("Expected Remote, got: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_topics_follows_page_tokens() {
        let mut server = mockito::Server::new_async().await;
        let second = server
            .mock("GET", "/v1/projects/proj/topics")
            .match_query(Matcher::UrlEncoded("pageToken".into(), "p2".into()))
            .with_status(200)
            .with_body(r#"{"topics":[{"name":"projects/proj/topics/c"}]}"#)
            .create_async()
            .await;
        let first = server
            .mock("GET", "/v1/projects/proj/topics")
            .match_query(Matcher::Regex("^$".into()))
            .with_status(200)
            .with_body(
                r#"{"topics":[{"name":"projects/proj/topics/a"},{"name":"projects/proj/topics/b"}],"nextPageToken":"p2"}"#,
            )
            .create_async()
            .await;

        let topics = client(&server.url()).list_topics().await.unwrap();
        assert_eq!(
            topics,
            vec![
                "projects/proj/topics/a",
                "projects/proj/topics/b",
                "projects/proj/topics/c"
            ]
        );
        first.assert_async().await;
        second.assert_async().await;
    }

    #[tokio::test]
    async fn test_list_subscriptions_empty_project() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/projects/proj/subscriptions")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let subs = client(&server.url()).list_subscriptions().await.unwrap();
        assert!(subs.is_empty());
    }

    #[tokio::test]
    async fn test_create_subscription_sends_topic() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("PUT", "/v1/projects/proj/subscriptions/workers")
            .match_body(Matcher::Json(json!({"topic": "projects/proj/topics/orders"})))
            .with_status(200)
            .with_body(
                r#"{"name":"projects/proj/subscriptions/workers","topic":"projects/proj/topics/orders"}"#,
            )
            .create_async()
            .await;

        let name = client(&server.url())
            .create_subscription("workers", "orders")
            .await
            .unwrap();
        assert_eq!(name, "projects/proj/subscriptions/workers");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_publish_encodes_data() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/projects/proj/topics/orders:publish")
            .match_body(Matcher::Json(json!({
                "messages": [{
                    "data": BASE64.encode(br#"{"id":7}"#),
                    "attributes": {"kind": "order"}
                }]
            })))
            .with_status(200)
            .with_body(r#"{"messageIds":["42"]}"#)
            .create_async()
            .await;

        let message = PubsubMessage::json(&json!({"id": 7}))
            .unwrap()
            .with_attribute("kind", "order");
        let id = client(&server.url()).publish("orders", message).await.unwrap();
        assert_eq!(id, "42");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_publish_rejects_empty_before_io() {
        // Unroutable endpoint: reaching the network would fail differently.
        let c = client("http://127.0.0.1:9");
        assert!(matches!(
            c.publish("orders", PubsubMessage::default()).await,
            Err(GcloudError::InvalidArgument(_))
        ));
        assert!(matches!(
            c.publish_batch("orders", &[]).await,
            Err(GcloudError::InvalidArgument(_))
        ));
        assert!(!c.is_connected().await);
    }

    #[tokio::test]
    async fn test_pull_decodes_messages() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/projects/proj/subscriptions/workers:pull")
            .match_body(Matcher::Json(json!({"maxMessages": 1000})))
            .with_status(200)
            .with_body(
                json!({
                    "receivedMessages": [{
                        "ackId": "ack-1",
                        "message": {
                            "data": BASE64.encode(b"hello"),
                            "attributes": {"a": "b"},
                            "messageId": "m1",
                            "publishTime": "2024-05-01T10:00:00.123456789Z"
                        }
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let messages = client(&server.url()).pull("workers", None).await.unwrap();
        assert_eq!(messages.len(), 1);
        let m = &messages[0];
        assert_eq!(m.text(), Some("hello"));
        assert_eq!(m.ack_id, "ack-1");
        assert_eq!(m.message_id, "m1");
        assert_eq!(m.attributes.get("a").map(String::as_str), Some("b"));
        assert!(m.publish_time.is_some());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_pull_nothing_available() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/projects/proj/subscriptions/workers:pull")
            .match_body(Matcher::Json(json!({"maxMessages": 5})))
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let messages = client(&server.url()).pull("workers", Some(5)).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_pulled_message_json() {
        let m = PulledMessage {
            message: br#"{"id":3}"#.to_vec(),
            attributes: HashMap::new(),
            message_id: "1".into(),
            ack_id: "a".into(),
            publish_time: None,
        };
        let v: serde_json::Value = m.json().unwrap();
        assert_eq!(v["id"], 3);
    }

    #[tokio::test]
    async fn test_unconfigured_fails_before_io() {
        let c = PubSubClient::new(&CloudConfig::default(), HttpClient::from_defaults().unwrap());
        assert!(matches!(c.create_topic("t").await, Err(GcloudError::Config(_))));
        assert!(matches!(c.list_topics().await, Err(GcloudError::Config(_))));
        assert!(matches!(
            c.create_subscription("s", "t").await,
            Err(GcloudError::Config(_))
        ));
        assert!(matches!(c.list_subscriptions().await, Err(GcloudError::Config(_))));
        assert!(matches!(
            c.publish("t", PubsubMessage::new("x")).await,
            Err(GcloudError::Config(_))
        ));
        assert!(matches!(c.pull("s", None).await, Err(GcloudError::Config(_))));
        assert!(matches!(c.connect().await, Err(GcloudError::Config(_))));
    }

    #[tokio::test]
    async fn test_missing_key_file_is_credential_error() {
        let tmp = TempDir::new().unwrap();
        let config = CloudConfig::default().with_pubsub(PubSubSettings::new(
            tmp.path().join("absent.json"),
            "proj",
        ));
        let c = PubSubClient::new(&config, HttpClient::from_defaults().unwrap());
        assert!(matches!(c.connect().await, Err(GcloudError::Credential(_))));
        assert!(!c.is_connected().await);
    }

    #[tokio::test]
    async fn test_connection_reused_until_closed() {
        let c = client("http://localhost:8085");
        c.connect().await.unwrap();
        assert!(c.is_connected().await);
        c.close().await;
        assert!(!c.is_connected().await);
        c.connect().await.unwrap();
        assert!(c.is_connected().await);
    }
}
