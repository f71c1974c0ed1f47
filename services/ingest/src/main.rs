//! Channel ingest service for medlens.
//!
//! Fetches new messages (and their photos) from every configured channel,
//! starting after each channel's last committed checkpoint, and commits them
//! in batches together with the checkpoint advance.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with INGEST__)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::Context;
use medlens_ingest::{
    CommitQueue, FetchOptions, HttpChannelSource, IngestConfig, IngestRunner, MediaStore,
    RawArchive,
};
use medlens_pipeline::RetryPolicy;
use medlens_storage::telemetry::{init_logging, init_metrics};
use medlens_storage::PgGateway;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = IngestConfig::load().context("Failed to load configuration")?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "medlens-ingest",
        version = env!("CARGO_PKG_VERSION"),
        channels = config.channels.len(),
        "Starting channel ingest"
    );

    // Validate configuration
    config.validate().context("Invalid configuration")?;
    init_metrics(config.metrics_port)?;

    let retry = RetryPolicy::new(config.retry.clone());

    let gateway = Arc::new(
        PgGateway::connect(&config.database, retry.clone())
            .await
            .context("Failed to initialize persistence gateway")?,
    );
    if config.database.run_migrations {
        gateway
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }
    gateway
        .register_channels(&config.channels)
        .await
        .context("Failed to register channels")?;

    let source = Arc::new(HttpChannelSource::new(&config.source)?);

    let commits = CommitQueue::start(
        gateway.clone(),
        config.fetch.persist_workers,
        config.fetch.commit_queue_size,
    );

    let mut runner = IngestRunner::new(
        source,
        gateway.clone(),
        commits.handle(),
        retry,
        config.source.session_concurrency,
        FetchOptions {
            page_size: config.fetch.page_size,
            page_delay: config.fetch.page_delay(),
            max_messages: config.fetch.max_messages_per_channel,
            download_media: config.fetch.download_media,
        },
    );
    if config.fetch.download_media {
        runner = runner.with_media(Arc::new(MediaStore::new(config.fetch.media_dir.clone())));
    }
    if config.fetch.archive_raw {
        runner = runner.with_archive(Arc::new(RawArchive::new(config.fetch.archive_dir.clone())));
    }

    let cancel = CancellationToken::new();
    let shutdown = tokio::spawn(shutdown_signal(cancel.clone()));

    let report = runner.run(&config.channels, cancel).await;
    shutdown.abort();

    // Release the runner's handle so the commit workers can drain and stop
    drop(runner);
    commits.shutdown().await;

    match report.to_run_record() {
        Ok(record) => {
            if let Err(e) = gateway.record_run(&record).await {
                warn!(error = %e, "Failed to store run report");
            }
        }
        Err(e) => warn!(error = %e, "Failed to serialize run report"),
    }

    for outcome in &report.channels {
        info!(
            channel = %outcome.channel,
            status = ?outcome.status,
            fetched = outcome.fetched,
            committed = outcome.committed,
            rejected = outcome.rejected,
            media_downloaded = outcome.media_downloaded,
            media_failed = outcome.media_failed,
            "Channel summary"
        );
    }

    if report.failed() > 0 {
        error!(
            failed = report.failed(),
            total = report.channels.len(),
            "Ingest finished with failed channels"
        );
    } else {
        info!(run_id = %report.run_id, "Ingest finished");
    }

    Ok(())
}

/// Cancel the run on SIGINT or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal, finishing current batches");
        }
        _ = terminate => {
            info!("Received SIGTERM signal, finishing current batches");
        }
    }

    cancel.cancel();
}
