//! Commit worker pool between the fetch workers and the persistence gateway.
//!
//! Fetch workers submit a batch and wait for its acknowledgement before
//! pulling the next page, so commits of one channel happen strictly in order
//! while commits of different channels can run on different workers.

use medlens_pipeline::{CheckpointAdvance, Failure, RawMessage, RecordStore, UpsertReport};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct CommitRequest {
    batch: Vec<RawMessage>,
    advance: CheckpointAdvance,
    reply: oneshot::Sender<Result<UpsertReport, Failure>>,
}

/// Owns the worker tasks. Dropping every [`CommitHandle`] and calling
/// [`CommitQueue::shutdown`] drains the queue and stops the workers.
pub struct CommitQueue {
    sender: mpsc::Sender<CommitRequest>,
    workers: Vec<JoinHandle<()>>,
}

/// Cloneable submission side of the queue.
#[derive(Clone)]
pub struct CommitHandle {
    sender: mpsc::Sender<CommitRequest>,
}

impl CommitQueue {
    /// Spawn `workers` tasks committing through `store`.
    pub fn start(store: Arc<dyn RecordStore>, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..workers.max(1))
            .map(|worker_id| {
                let store = store.clone();
                let receiver = receiver.clone();
                tokio::spawn(commit_worker(worker_id, store, receiver))
            })
            .collect::<Vec<_>>();

        info!(workers = workers.len(), capacity, "Commit workers started");

        Self { sender, workers }
    }

    pub fn handle(&self) -> CommitHandle {
        CommitHandle {
            sender: self.sender.clone(),
        }
    }

    /// Close the queue and wait for queued commits to finish.
    pub async fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Commit worker ended abnormally");
            }
        }
        info!("Commit workers stopped");
    }
}

impl CommitHandle {
    /// Submit a batch and wait until it is committed (or failed).
    pub async fn commit(
        &self,
        batch: Vec<RawMessage>,
        advance: CheckpointAdvance,
    ) -> Result<UpsertReport, Failure> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(CommitRequest {
                batch,
                advance,
                reply,
            })
            .await
            .map_err(|_| Failure::fatal("commit queue closed"))?;

        response
            .await
            .map_err(|_| Failure::fatal("commit worker dropped the request"))?
    }
}

async fn commit_worker(
    worker_id: usize,
    store: Arc<dyn RecordStore>,
    receiver: Arc<Mutex<mpsc::Receiver<CommitRequest>>>,
) {
    loop {
        let request = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(request) = request else {
            break;
        };

        let channel = request.advance.channel.clone();
        let to = request.advance.to;
        let result = store.commit_batch(request.batch, request.advance).await;

        match &result {
            Ok(report) => debug!(
                worker_id,
                channel = %channel,
                to,
                committed = report.committed,
                rejected = report.rejected.len(),
                "Batch committed"
            ),
            Err(e) => warn!(worker_id, channel = %channel, to, error = %e, "Batch commit failed"),
        }

        if request.reply.send(result).is_err() {
            warn!(worker_id, channel = %channel, "Submitter went away before commit finished");
        }
    }
}
