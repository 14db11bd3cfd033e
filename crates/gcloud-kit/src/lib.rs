// gcloud-kit: async clients for Pub/Sub, Cloud Storage, Cloud Tasks and Google Drive

pub mod auth;
pub mod cloud;
pub mod config;
pub mod connector;
pub mod crypto;
pub mod errors;
pub mod fileops;
pub mod http_client;
pub mod logger;
pub mod utils;

pub use cloud::drive::{DriveClient, DriveFile, DriveRecord};
pub use cloud::drive_query::DriveQuery;
pub use cloud::pubsub::{PubSubClient, PubsubMessage, PulledMessage};
pub use cloud::storage::{StorageClient, StoredObject};
pub use cloud::tasks::{Task, TaskHttpMethod, TasksClient};
pub use cloud::CloudClient;
pub use config::CloudConfig;
pub use errors::{GcloudError, Result};
pub use http_client::HttpClient;
