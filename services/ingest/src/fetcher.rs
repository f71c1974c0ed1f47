//! Rate-limit aware reader producing message batches for one channel.
//!
//! A [`ChannelFetcher`] starts from a channel's durable checkpoint and yields
//! batches strictly newer than it, ascending by message id. It never touches
//! the checkpoint itself: the cursor kept here only decides what to request
//! next, and the durable checkpoint moves when the batch is committed. A
//! fetcher rebuilt from the durable checkpoint restarts the sequence.

use crate::media_store::MediaStore;
use crate::source::{ChannelSource, MediaKind, SourceMessage};
use chrono::Utc;
use medlens_pipeline::{CheckpointAdvance, Failure, RawMessage, RetryPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

/// Paging settings for a fetcher.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub page_size: usize,
    pub page_delay: Duration,
    pub max_messages: Option<usize>,
    pub download_media: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            page_size: 120,
            page_delay: Duration::from_secs(2),
            max_messages: None,
            download_media: true,
        }
    }
}

/// One page of messages, ready to be committed.
#[derive(Debug, Clone)]
pub struct FetchedBatch {
    pub channel: String,
    /// Messages in ascending id order, no duplicates
    pub messages: Vec<RawMessage>,
    /// Largest id in the page; the checkpoint target once committed
    pub high_water: i64,
    pub media_downloaded: usize,
    pub media_failed: usize,
}

impl FetchedBatch {
    pub fn advance(&self) -> CheckpointAdvance {
        CheckpointAdvance {
            channel: self.channel.clone(),
            to: self.high_water,
        }
    }
}

pub struct ChannelFetcher {
    source: Arc<dyn ChannelSource>,
    channel: String,
    cursor: i64,
    emitted: usize,
    pages: usize,
    exhausted: bool,
    options: FetchOptions,
    retry: RetryPolicy,
    gate: Arc<Semaphore>,
    media: Option<Arc<MediaStore>>,
}

impl ChannelFetcher {
    pub fn new(
        source: Arc<dyn ChannelSource>,
        channel: impl Into<String>,
        checkpoint: i64,
        options: FetchOptions,
        retry: RetryPolicy,
        gate: Arc<Semaphore>,
        media: Option<Arc<MediaStore>>,
    ) -> Self {
        Self {
            source,
            channel: channel.into(),
            cursor: checkpoint.max(0),
            emitted: 0,
            pages: 0,
            exhausted: false,
            options,
            retry,
            gate,
            media,
        }
    }

    /// Largest id handed out so far (or the starting checkpoint).
    pub fn cursor(&self) -> i64 {
        self.cursor
    }

    /// Next batch, or `None` once the channel has nothing newer.
    ///
    /// Rate-limit signals are absorbed here: the identical request is repeated
    /// after the signalled wait. Transient failures are retried with backoff;
    /// exhaustion surfaces as `Failure::Fatal`. The cursor only moves once a
    /// page has been received.
    pub async fn next_batch(&mut self) -> Result<Option<FetchedBatch>, Failure> {
        if self.exhausted {
            return Ok(None);
        }

        let remaining = match self.options.max_messages {
            Some(max) if self.emitted >= max => {
                debug!(channel = %self.channel, max, "Per-run message limit reached");
                self.exhausted = true;
                return Ok(None);
            }
            Some(max) => max - self.emitted,
            None => usize::MAX,
        };
        let limit = self.options.page_size.min(remaining).max(1);

        if self.pages > 0 && !self.options.page_delay.is_zero() {
            tokio::time::sleep(self.options.page_delay).await;
        }

        let source = &self.source;
        let channel = self.channel.as_str();
        let after_id = self.cursor;
        let page = self
            .retry
            .run_gated("fetch_after", &self.gate, move || {
                source.fetch_after(channel, after_id, limit)
            })
            .await?;

        let page = order_page(page, after_id, limit);
        let Some(high_water) = page.last().map(|m| m.id) else {
            debug!(channel = %self.channel, after_id, "No newer messages");
            self.exhausted = true;
            return Ok(None);
        };

        let mut batch = FetchedBatch {
            channel: self.channel.clone(),
            messages: Vec::with_capacity(page.len()),
            high_water,
            media_downloaded: 0,
            media_failed: 0,
        };

        for message in page {
            let media_path = match message.media {
                Some(MediaKind::Photo) if self.options.download_media => {
                    match self.fetch_media(message.id).await {
                        Ok(path) => {
                            batch.media_downloaded += 1;
                            Some(path)
                        }
                        Err(e) => {
                            warn!(
                                channel = %self.channel,
                                message_id = message.id,
                                error = %e,
                                "Media download failed, storing message without it"
                            );
                            batch.media_failed += 1;
                            None
                        }
                    }
                }
                _ => None,
            };
            batch.messages.push(to_raw_message(&self.channel, message, media_path));
        }

        self.cursor = high_water;
        self.emitted += batch.messages.len();
        self.pages += 1;

        metrics::counter!("medlens.fetch.messages").increment(batch.messages.len() as u64);
        debug!(
            channel = %self.channel,
            after_id,
            high_water,
            messages = batch.messages.len(),
            "Fetched batch"
        );

        Ok(Some(batch))
    }

    async fn fetch_media(&self, message_id: i64) -> Result<String, Failure> {
        let Some(media) = &self.media else {
            return Err(Failure::fatal("no media store configured"));
        };

        let source = &self.source;
        let channel = self.channel.as_str();
        let payload = self
            .retry
            .run_gated("download_media", &self.gate, move || {
                source.download_media(channel, message_id)
            })
            .await?;

        media.save(channel, message_id, &payload).await
    }
}

/// Keep ids above `after_id`, ascending, de-duplicated, at most `limit`.
pub fn order_page(mut page: Vec<SourceMessage>, after_id: i64, limit: usize) -> Vec<SourceMessage> {
    page.retain(|m| m.id > after_id);
    page.sort_by_key(|m| m.id);
    page.dedup_by_key(|m| m.id);
    page.truncate(limit);
    page
}

fn to_raw_message(channel: &str, message: SourceMessage, media_path: Option<String>) -> RawMessage {
    RawMessage {
        channel: channel.to_string(),
        message_id: message.id,
        posted_at: message.posted_at,
        text: message.text.unwrap_or_default(),
        views: message.views.unwrap_or(0),
        forwards: message.forwards.unwrap_or(0),
        has_media: message.media.is_some(),
        media_path,
        ingested_at: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ChannelInfo, MediaPayload};
    use medlens_pipeline::store::async_trait;
    use medlens_pipeline::RetryConfig;
    use parking_lot::Mutex;

    fn message(id: i64) -> SourceMessage {
        SourceMessage {
            id,
            posted_at: Utc::now(),
            text: Some(format!("post {id}")),
            views: Some(10),
            forwards: None,
            media: None,
        }
    }

    /// Serves fixed messages; photo downloads fail for ids in `broken_media`.
    struct StaticSource {
        messages: Vec<SourceMessage>,
        broken_media: Vec<i64>,
        calls: Mutex<Vec<(i64, usize)>>,
    }

    #[async_trait]
    impl ChannelSource for StaticSource {
        async fn resolve(&self, handle: &str) -> Result<ChannelInfo, Failure> {
            Ok(ChannelInfo {
                handle: handle.to_string(),
                title: String::new(),
            })
        }

        async fn fetch_after(
            &self,
            _handle: &str,
            after_id: i64,
            limit: usize,
        ) -> Result<Vec<SourceMessage>, Failure> {
            self.calls.lock().push((after_id, limit));
            let mut page: Vec<_> = self
                .messages
                .iter()
                .filter(|m| m.id > after_id)
                .cloned()
                .collect();
            page.sort_by_key(|m| m.id);
            page.truncate(limit);
            // newest first, like the upstream API
            page.reverse();
            Ok(page)
        }

        async fn download_media(&self, _handle: &str, message_id: i64) -> Result<MediaPayload, Failure> {
            if self.broken_media.contains(&message_id) {
                return Err(Failure::fatal("media not found"));
            }
            Ok(MediaPayload {
                bytes: vec![1, 2, 3],
                content_type: Some("image/jpeg".to_string()),
            })
        }
    }

    fn options(page_size: usize) -> FetchOptions {
        FetchOptions {
            page_size,
            page_delay: Duration::ZERO,
            max_messages: None,
            download_media: true,
        }
    }

    fn retry() -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            base_delay_ms: 10,
            max_delay_ms: 100,
            ..Default::default()
        })
    }

    #[test]
    fn test_order_page() {
        let page = vec![message(5), message(3), message(9), message(5), message(1)];
        let ordered: Vec<i64> = order_page(page, 2, 10).iter().map(|m| m.id).collect();
        assert_eq!(ordered, vec![3, 5, 9]);

        let page = vec![message(5), message(3), message(9)];
        let ordered: Vec<i64> = order_page(page, 0, 2).iter().map(|m| m.id).collect();
        assert_eq!(ordered, vec![3, 5]);
    }

    #[tokio::test]
    async fn test_batches_ascend_from_checkpoint() {
        let source = Arc::new(StaticSource {
            messages: (1..=7).map(message).collect(),
            broken_media: vec![],
            calls: Mutex::new(vec![]),
        });
        let mut fetcher = ChannelFetcher::new(
            source.clone(),
            "chemed123",
            2,
            options(3),
            retry(),
            Arc::new(Semaphore::new(1)),
            None,
        );

        let first = fetcher.next_batch().await.unwrap().unwrap();
        let ids: Vec<i64> = first.messages.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert_eq!(first.high_water, 5);
        assert_eq!(first.advance().to, 5);

        let second = fetcher.next_batch().await.unwrap().unwrap();
        let ids: Vec<i64> = second.messages.iter().map(|m| m.message_id).collect();
        assert_eq!(ids, vec![6, 7]);

        assert!(fetcher.next_batch().await.unwrap().is_none());
        assert!(fetcher.next_batch().await.unwrap().is_none());

        let calls = source.calls.lock().clone();
        assert_eq!(calls, vec![(2, 3), (5, 3), (7, 3)]);
    }

    #[tokio::test]
    async fn test_max_messages_limits_run() {
        let source = Arc::new(StaticSource {
            messages: (1..=10).map(message).collect(),
            broken_media: vec![],
            calls: Mutex::new(vec![]),
        });
        let mut opts = options(4);
        opts.max_messages = Some(6);
        let mut fetcher = ChannelFetcher::new(
            source,
            "chemed123",
            0,
            opts,
            retry(),
            Arc::new(Semaphore::new(1)),
            None,
        );

        let mut total = 0;
        while let Some(batch) = fetcher.next_batch().await.unwrap() {
            total += batch.messages.len();
        }
        assert_eq!(total, 6);
        assert_eq!(fetcher.cursor(), 6);
    }

    #[tokio::test]
    async fn test_failed_media_download_keeps_message() {
        let dir = tempfile::tempdir().unwrap();
        let mut with_photo = message(1);
        with_photo.media = Some(MediaKind::Photo);
        let mut broken_photo = message(2);
        broken_photo.media = Some(MediaKind::Photo);
        let mut document = message(3);
        document.media = Some(MediaKind::Other);

        let source = Arc::new(StaticSource {
            messages: vec![with_photo, broken_photo, document],
            broken_media: vec![2],
            calls: Mutex::new(vec![]),
        });
        let mut fetcher = ChannelFetcher::new(
            source,
            "yenehealth",
            0,
            options(10),
            retry(),
            Arc::new(Semaphore::new(1)),
            Some(Arc::new(MediaStore::new(dir.path()))),
        );

        let batch = fetcher.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.messages.len(), 3);
        assert_eq!(batch.media_downloaded, 1);
        assert_eq!(batch.media_failed, 1);

        let photo = &batch.messages[0];
        assert!(photo.has_media);
        assert!(photo.media_path.as_deref().unwrap().ends_with("yenehealth/1.jpg"));

        let broken = &batch.messages[1];
        assert!(broken.has_media);
        assert!(broken.media_path.is_none());

        let doc = &batch.messages[2];
        assert!(doc.has_media);
        assert!(doc.media_path.is_none());
        assert_eq!(doc.forwards, 0);
    }
}
