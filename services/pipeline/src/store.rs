//! Storage seams used by the fetch engine and detection ingest.
//!
//! The PostgreSQL gateway in `medlens-storage` implements both traits;
//! tests substitute in-memory or mocked stores.

use crate::error::Failure;
use crate::model::{Checkpoint, CheckpointAdvance, MessageKey, RawMessage, Record, UpsertReport};
use std::collections::HashMap;
use std::sync::Arc;

pub use async_trait::async_trait;

/// Durable per-channel cursor.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Last committed checkpoint for a channel, `None` if the channel was
    /// never committed.
    async fn load_checkpoint(&self, channel: &str) -> Result<Option<Checkpoint>, Failure>;
}

/// Idempotent record persistence.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Upsert a mixed batch in one transaction. Invalid rows are excluded and
    /// reported; the rest commit.
    async fn upsert(&self, batch: Vec<Record>) -> Result<UpsertReport, Failure>;

    /// Upsert fetched messages and advance the channel checkpoint in the same
    /// transaction. On `Err` nothing was committed.
    async fn commit_batch(
        &self,
        batch: Vec<RawMessage>,
        advance: CheckpointAdvance,
    ) -> Result<UpsertReport, Failure>;

    /// Resolve stored media paths to the message that carried them.
    /// Paths without a matching message are absent from the result.
    async fn attribute_media(&self, paths: &[String]) -> Result<HashMap<String, MessageKey>, Failure>;
}

#[async_trait]
impl<T: CheckpointStore + ?Sized> CheckpointStore for Arc<T> {
    async fn load_checkpoint(&self, channel: &str) -> Result<Option<Checkpoint>, Failure> {
        (**self).load_checkpoint(channel).await
    }
}

#[async_trait]
impl<T: RecordStore + ?Sized> RecordStore for Arc<T> {
    async fn upsert(&self, batch: Vec<Record>) -> Result<UpsertReport, Failure> {
        (**self).upsert(batch).await
    }

    async fn commit_batch(
        &self,
        batch: Vec<RawMessage>,
        advance: CheckpointAdvance,
    ) -> Result<UpsertReport, Failure> {
        (**self).commit_batch(batch, advance).await
    }

    async fn attribute_media(&self, paths: &[String]) -> Result<HashMap<String, MessageKey>, Failure> {
        (**self).attribute_media(paths).await
    }
}
