//! Hand-off point for the external message-persistence service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateMessage {
    pub sender_id: String,
    pub recipient_id: String,
    pub content: String,
    pub sent_at: DateTime<Utc>,
}

/// Stores private messages. Implementations should not block for long; the
/// gateway awaits them on a detached task.
#[async_trait]
pub trait ChatArchive: Send + Sync {
    async fn store_private(&self, message: PrivateMessage) -> Result<(), crate::BoxError>;
}
