//! Abstraction over the external channel source.

use chrono::{DateTime, Utc};
use medlens_pipeline::store::async_trait;
use medlens_pipeline::Failure;
use serde::{Deserialize, Serialize};

/// Channel metadata returned by [`ChannelSource::resolve`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    pub handle: String,
    #[serde(default)]
    pub title: String,
}

/// Kind of attachment carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Other,
}

/// A message as delivered by the source, before normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceMessage {
    pub id: i64,
    pub posted_at: DateTime<Utc>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub views: Option<i64>,
    #[serde(default)]
    pub forwards: Option<i64>,
    #[serde(default)]
    pub media: Option<MediaKind>,
}

/// Downloaded media bytes.
#[derive(Debug, Clone)]
pub struct MediaPayload {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Read access to channels of the external platform.
///
/// Implementations map every failure onto [`Failure`]: a flood-wait signal
/// becomes `RateLimited` with the exact wait, connection trouble becomes
/// `Transient`, anything the source refuses outright becomes `Fatal`.
#[async_trait]
pub trait ChannelSource: Send + Sync {
    /// Look up a channel by handle.
    async fn resolve(&self, handle: &str) -> Result<ChannelInfo, Failure>;

    /// Up to `limit` messages with id greater than `after_id`, in any order.
    async fn fetch_after(
        &self,
        handle: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<SourceMessage>, Failure>;

    /// Media attached to a message.
    async fn download_media(&self, handle: &str, message_id: i64) -> Result<MediaPayload, Failure>;
}
