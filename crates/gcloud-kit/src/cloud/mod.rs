pub mod drive;
pub mod drive_query;
pub mod pubsub;
pub mod storage;
pub mod tasks;

use async_trait::async_trait;

use crate::errors::Result;

/// Connection lifecycle shared by every service client.
///
/// Operations connect on demand; `connect` only surfaces configuration and
/// credential problems early. `close` releases the connection and the next
/// operation opens a new one.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Display name of the service (e.g. "Cloud Storage").
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    /// Drop the current connection, if any.
    async fn close(&self);

    async fn is_connected(&self) -> bool;
}
