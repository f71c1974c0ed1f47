//! Logging and metrics setup shared by the medlens binaries.

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use tracing::level_filters::LevelFilter;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Initialize the tracing/logging subsystem.
///
/// `RUST_LOG` directives win over `config.level` for the crates they name.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    let level = parse_level(&config.level);

    let filter = EnvFilter::from_default_env()
        .add_directive(LevelFilter::from_level(level).into())
        .add_directive("sqlx=warn".parse()?)
        .add_directive("hyper=info".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init()
            .context("Failed to install tracing subscriber")?;
    } else {
        subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .try_init()
            .context("Failed to install tracing subscriber")?;
    }

    Ok(())
}

fn parse_level(level: &str) -> Level {
    match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the Prometheus exporter when a port is configured.
pub fn init_metrics(port: Option<u16>) -> Result<()> {
    let Some(port) = port else {
        return Ok(());
    };

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}
