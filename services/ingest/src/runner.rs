//! Run orchestration: one fetch worker per channel.
//!
//! All workers share one session [`Semaphore`], so the number of concurrent
//! requests against the source never exceeds `session_concurrency`. A failed
//! channel is reported in its [`ChannelOutcome`] and never stops its siblings.

use crate::commit_queue::CommitHandle;
use crate::fetcher::{ChannelFetcher, FetchOptions};
use crate::media_store::MediaStore;
use crate::raw_archive::RawArchive;
use crate::source::ChannelSource;
use chrono::{DateTime, Utc};
use medlens_pipeline::{Channel, CheckpointStore, Failure, RetryPolicy};
use medlens_storage::RunRecord;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Final state of one channel in a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChannelStatus {
    Succeeded,
    Failed { reason: String },
    Cancelled,
}

/// Per-channel counters of a run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelOutcome {
    pub channel: String,
    #[serde(flatten)]
    pub status: ChannelStatus,
    pub fetched: usize,
    pub committed: usize,
    pub rejected: usize,
    pub media_downloaded: usize,
    pub media_failed: usize,
    pub batches: usize,
    pub checkpoint_before: Option<i64>,
    pub checkpoint_after: Option<i64>,
}

impl ChannelOutcome {
    fn new(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            status: ChannelStatus::Succeeded,
            fetched: 0,
            committed: 0,
            rejected: 0,
            media_downloaded: 0,
            media_failed: 0,
            batches: 0,
            checkpoint_before: None,
            checkpoint_after: None,
        }
    }
}

/// Summary of an ingest run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub channels: Vec<ChannelOutcome>,
}

impl RunReport {
    fn count(&self, pred: impl Fn(&ChannelStatus) -> bool) -> usize {
        self.channels.iter().filter(|c| pred(&c.status)).count()
    }

    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, ChannelStatus::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, ChannelStatus::Failed { .. }))
    }

    pub fn cancelled(&self) -> usize {
        self.count(|s| matches!(s, ChannelStatus::Cancelled))
    }

    pub fn committed(&self) -> usize {
        self.channels.iter().map(|c| c.committed).sum()
    }

    /// Row for the `ingest_runs` table.
    pub fn to_run_record(&self) -> Result<RunRecord, serde_json::Error> {
        Ok(RunRecord {
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: self.finished_at,
            succeeded: self.succeeded() as i32,
            failed: self.failed() as i32,
            cancelled: self.cancelled() as i32,
            report: serde_json::to_value(self)?,
        })
    }
}

/// Everything a channel worker needs, shared across workers.
#[derive(Clone)]
struct WorkerContext {
    source: Arc<dyn ChannelSource>,
    checkpoints: Arc<dyn CheckpointStore>,
    commits: CommitHandle,
    retry: RetryPolicy,
    gate: Arc<Semaphore>,
    fetch: FetchOptions,
    media: Option<Arc<MediaStore>>,
    archive: Option<Arc<RawArchive>>,
}

pub struct IngestRunner {
    context: WorkerContext,
}

impl IngestRunner {
    pub fn new(
        source: Arc<dyn ChannelSource>,
        checkpoints: Arc<dyn CheckpointStore>,
        commits: CommitHandle,
        retry: RetryPolicy,
        session_concurrency: usize,
        fetch: FetchOptions,
    ) -> Self {
        Self {
            context: WorkerContext {
                source,
                checkpoints,
                commits,
                retry,
                gate: Arc::new(Semaphore::new(session_concurrency.max(1))),
                fetch,
                media: None,
                archive: None,
            },
        }
    }

    /// Store downloaded photos in `media`.
    pub fn with_media(mut self, media: Arc<MediaStore>) -> Self {
        self.context.media = Some(media);
        self
    }

    /// Append every fetched batch to `archive` before it is committed.
    pub fn with_archive(mut self, archive: Arc<RawArchive>) -> Self {
        self.context.archive = Some(archive);
        self
    }

    /// Ingest every channel until it is drained, fails or `cancel` fires.
    #[instrument(skip_all, fields(channels = channels.len()))]
    pub async fn run(&self, channels: &[Channel], cancel: CancellationToken) -> RunReport {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(run_id = %run_id, "Ingest run started");

        let context = Arc::new(self.context.clone());

        let workers: Vec<_> = channels
            .iter()
            .map(|channel| {
                let progress = Arc::new(Mutex::new(ChannelOutcome::new(&channel.handle)));
                let handle = tokio::spawn(run_channel(
                    context.clone(),
                    channel.handle.clone(),
                    cancel.clone(),
                    progress.clone(),
                ));
                (progress, handle)
            })
            .collect();

        let (progress, handles): (Vec<_>, Vec<_>) = workers.into_iter().unzip();
        let results = futures::future::join_all(handles).await;

        let outcomes = progress
            .into_iter()
            .zip(results)
            .map(|(progress, result)| {
                let mut outcome = progress.lock().clone();
                outcome.status = match result {
                    Ok(status) => status,
                    Err(e) => {
                        error!(channel = %outcome.channel, error = %e, "Channel worker crashed");
                        ChannelStatus::Failed {
                            reason: format!("worker crashed: {}", e),
                        }
                    }
                };
                outcome
            })
            .collect();

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            channels: outcomes,
        };

        info!(
            run_id = %run_id,
            succeeded = report.succeeded(),
            failed = report.failed(),
            cancelled = report.cancelled(),
            committed = report.committed(),
            "Ingest run finished"
        );

        report
    }
}

#[instrument(skip(ctx, cancel, progress))]
async fn run_channel(
    ctx: Arc<WorkerContext>,
    channel: String,
    cancel: CancellationToken,
    progress: Arc<Mutex<ChannelOutcome>>,
) -> ChannelStatus {
    let status = match drive_channel(&ctx, &channel, &cancel, &progress).await {
        Ok(status) => status,
        Err(failure) => {
            metrics::counter!("medlens.ingest.channel_failures", "kind" => failure.kind().as_str())
                .increment(1);
            error!(channel = %channel, error = %failure, "Channel ingest failed");
            ChannelStatus::Failed {
                reason: failure.to_string(),
            }
        }
    };

    let outcome = progress.lock().clone();
    info!(
        channel = %channel,
        status = ?status,
        fetched = outcome.fetched,
        committed = outcome.committed,
        rejected = outcome.rejected,
        checkpoint_before = ?outcome.checkpoint_before,
        checkpoint_after = ?outcome.checkpoint_after,
        "Channel finished"
    );
    status
}

async fn drive_channel(
    ctx: &WorkerContext,
    channel: &str,
    cancel: &CancellationToken,
    progress: &Mutex<ChannelOutcome>,
) -> Result<ChannelStatus, Failure> {
    let source = &ctx.source;
    let info = ctx
        .retry
        .run_gated("resolve", &ctx.gate, move || source.resolve(channel))
        .await?;
    info!(channel, title = %info.title, "Channel resolved");

    let checkpoint = ctx
        .checkpoints
        .load_checkpoint(channel)
        .await?
        .map(|c| c.last_message_id);
    {
        let mut p = progress.lock();
        p.checkpoint_before = checkpoint;
        p.checkpoint_after = checkpoint;
    }

    let mut fetcher = ChannelFetcher::new(
        ctx.source.clone(),
        channel,
        checkpoint.unwrap_or(0),
        ctx.fetch.clone(),
        ctx.retry.clone(),
        ctx.gate.clone(),
        ctx.media.clone(),
    );

    loop {
        if cancel.is_cancelled() {
            warn!(channel, "Cancelled between batches");
            return Ok(ChannelStatus::Cancelled);
        }

        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(channel, "Cancelled while fetching, in-flight page discarded");
                return Ok(ChannelStatus::Cancelled);
            }
            next = fetcher.next_batch() => next?,
        };

        let Some(batch) = next else {
            return Ok(ChannelStatus::Succeeded);
        };

        let advance = batch.advance();
        let fetched = batch.messages.len();
        let media_downloaded = batch.media_downloaded;
        let media_failed = batch.media_failed;

        // Archive failures never block the commit
        if let Some(archive) = &ctx.archive {
            if let Err(e) = archive.append(channel, &batch.messages).await {
                metrics::counter!("medlens.ingest.archive_failures").increment(1);
                warn!(channel, error = %e, "Failed to archive fetched messages");
            }
        }

        let report = ctx.commits.commit(batch.messages, advance.clone()).await?;

        let mut p = progress.lock();
        p.fetched += fetched;
        p.committed += report.committed;
        p.rejected += report.rejected.len();
        p.media_downloaded += media_downloaded;
        p.media_failed += media_failed;
        p.batches += 1;
        p.checkpoint_after = Some(p.checkpoint_after.map_or(advance.to, |c| c.max(advance.to)));
    }
}
