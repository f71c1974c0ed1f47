//! Configuration management for the channel ingest service.
//!
//! This module handles loading and validating configuration from environment
//! variables and configuration files.

use config::{Config, ConfigError, Environment, File};
use medlens_pipeline::model::validate_handle;
use medlens_pipeline::{Channel, RetryConfig};
use medlens_storage::{DatabaseConfig, LoggingConfig};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

pub use medlens_storage::ConfigValidationError;

/// Main configuration for the ingest service.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Session gateway connection
    pub source: SourceConfig,

    /// Paging and media settings
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Retry policy shared by source calls and commits
    #[serde(default)]
    pub retry: RetryConfig,

    /// PostgreSQL connection
    pub database: DatabaseConfig,

    /// Channels to ingest
    #[serde(default)]
    pub channels: Vec<Channel>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Prometheus exporter port; no exporter when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// Session gateway configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the session gateway (e.g., "http://session-gateway:8080")
    pub base_url: String,

    /// Bearer token, if the gateway requires one
    #[serde(default)]
    pub api_token: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Concurrent requests allowed against the session
    #[serde(default = "default_session_concurrency")]
    pub session_concurrency: usize,
}

/// Paging, pacing and media configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    /// Messages requested per page
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Pause between pages of one channel in milliseconds
    #[serde(default = "default_page_delay_ms")]
    pub page_delay_ms: u64,

    /// Upper bound of messages per channel per run (unset = no bound)
    #[serde(default)]
    pub max_messages_per_channel: Option<usize>,

    /// Whether to download photos
    #[serde(default = "default_download_media")]
    pub download_media: bool,

    /// Root directory for downloaded media
    #[serde(default = "default_media_dir")]
    pub media_dir: PathBuf,

    /// Whether to append fetched messages to the JSON Lines archive
    #[serde(default = "default_archive_raw")]
    pub archive_raw: bool,

    /// Root directory of the raw message archive
    #[serde(default = "default_archive_dir")]
    pub archive_dir: PathBuf,

    /// Number of commit workers
    #[serde(default = "default_persist_workers")]
    pub persist_workers: usize,

    /// Bound of the commit request queue
    #[serde(default = "default_commit_queue_size")]
    pub commit_queue_size: usize,
}

// Default value functions
fn default_request_timeout() -> u64 {
    30
}
fn default_session_concurrency() -> usize {
    1
}
fn default_page_size() -> usize {
    120
}
fn default_page_delay_ms() -> u64 {
    2000
}
fn default_download_media() -> bool {
    true
}
fn default_media_dir() -> PathBuf {
    PathBuf::from("data/raw/images")
}
fn default_archive_raw() -> bool {
    true
}
fn default_archive_dir() -> PathBuf {
    PathBuf::from("data/raw/messages")
}
fn default_persist_workers() -> usize {
    2
}
fn default_commit_queue_size() -> usize {
    16
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            page_delay_ms: default_page_delay_ms(),
            max_messages_per_channel: None,
            download_media: default_download_media(),
            media_dir: default_media_dir(),
            archive_raw: default_archive_raw(),
            archive_dir: default_archive_dir(),
            persist_workers: default_persist_workers(),
            commit_queue_size: default_commit_queue_size(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default config file (config/default.toml)
    /// 2. Environment-specific config (config/{env}.toml)
    /// 3. Environment variables (prefixed with INGEST__)
    pub fn load() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let config = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // e.g., INGEST__SOURCE__BASE_URL
            .add_source(
                Environment::with_prefix("INGEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: IngestConfig = config.try_deserialize()?;
        config.normalize();
        Ok(config)
    }

    /// Strip `@` and whitespace from configured channel handles.
    pub fn normalize(&mut self) {
        for channel in &mut self.channels {
            *channel = Channel::new(
                channel.handle.as_str(),
                channel.display_name.as_str(),
                channel.category.as_str(),
            );
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.source.base_url.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "source.base_url".to_string(),
            ));
        }
        if !self.source.base_url.starts_with("http://")
            && !self.source.base_url.starts_with("https://")
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "source.base_url".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }
        if self.source.session_concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "source.session_concurrency".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.fetch.page_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "fetch.page_size".to_string(),
                message: "Page size must be greater than 0".to_string(),
            });
        }
        if self.fetch.persist_workers == 0 || self.fetch.commit_queue_size == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "fetch.persist_workers/commit_queue_size".to_string(),
                message: "Must be greater than 0".to_string(),
            });
        }

        if self.channels.is_empty() {
            return Err(ConfigValidationError::MissingField("channels".to_string()));
        }
        let mut seen = HashSet::new();
        for channel in &self.channels {
            validate_handle(&channel.handle).map_err(|e| ConfigValidationError::InvalidValue {
                field: "channels.handle".to_string(),
                message: e.to_string(),
            })?;
            if !seen.insert(channel.handle.to_lowercase()) {
                return Err(ConfigValidationError::InvalidValue {
                    field: "channels.handle".to_string(),
                    message: format!("duplicate channel {}", channel.handle),
                });
            }
        }

        self.retry
            .check()
            .map_err(|message| ConfigValidationError::InvalidValue {
                field: "retry".to_string(),
                message,
            })?;

        self.database.validate()
    }
}

impl SourceConfig {
    /// Get request timeout as Duration.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl FetchConfig {
    /// Get page delay as Duration.
    pub fn page_delay(&self) -> Duration {
        Duration::from_millis(self.page_delay_ms)
    }
}
