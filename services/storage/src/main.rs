//! Classification run for medlens.
//!
//! Reads the object-detector output, attributes every image to the message
//! that carried it, classifies it and upserts the result.
//!
//! Usage: `medlens-classify [DETECTIONS_FILE] [THRESHOLD]`. Arguments
//! override `detections.path` and `classification.threshold`.

use anyhow::{Context, Result};
use medlens_pipeline::{category_description, RetryPolicy};
use medlens_storage::telemetry::{init_logging, init_metrics};
use medlens_storage::{Config, DetectionIngest, DetectionIngestOptions, PgGateway};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let mut config = Config::load().context("Failed to load configuration")?;
    apply_args(&mut config, std::env::args().skip(1))?;

    init_logging(&config.logging)?;

    info!(
        service = %config.service.name,
        version = env!("CARGO_PKG_VERSION"),
        detections = %config.detections.path.display(),
        threshold = config.classification.threshold,
        "Starting classification run"
    );

    config.validate().context("Invalid configuration")?;
    init_metrics(config.service.metrics_port)?;

    let gateway = Arc::new(
        PgGateway::connect(&config.database, RetryPolicy::new(config.retry.clone()))
            .await
            .context("Failed to initialize persistence gateway")?,
    );

    if config.database.run_migrations {
        gateway
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let ingest = DetectionIngest::new(
        gateway,
        DetectionIngestOptions {
            threshold: config.classification.threshold()?,
            batch_size: config.classification.batch_size,
            catalog: config.classification.catalog.clone(),
        },
    );

    let summary = ingest
        .ingest_file(&config.detections.path)
        .await
        .context("Detection ingest failed")?;

    for (category, count) in &summary.per_category {
        info!(
            category = %category,
            description = category_description(*category),
            images = count,
            "Category total"
        );
    }

    info!(
        summary = %serde_json::to_string(&summary)?,
        "Classification run finished"
    );

    Ok(())
}

/// Apply positional command line overrides.
fn apply_args(config: &mut Config, mut args: impl Iterator<Item = String>) -> Result<()> {
    if let Some(path) = args.next() {
        config.detections.path = PathBuf::from(path);
    }
    if let Some(threshold) = args.next() {
        config.classification.threshold = threshold
            .parse()
            .with_context(|| format!("Threshold must be a number, got {:?}", threshold))?;
    }
    Ok(())
}
