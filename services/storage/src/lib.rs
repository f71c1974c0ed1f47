//! Medlens Storage
//!
//! Idempotent persistence for the medlens pipeline. Fetched messages and image
//! classifications are upserted into PostgreSQL in per-batch transactions,
//! together with the per-channel checkpoints that make ingest restartable.
//!
//! ## Features
//!
//! - **Exactly-once stored state**: upserts keyed by `(channel, message_id)`
//!   and `image_path` turn at-least-once delivery into one row per key
//! - **Atomic checkpoints**: a channel cursor only moves in the transaction
//!   that commits the batch it follows, and never backwards
//! - **Row isolation**: invalid rows are excluded and reported, the rest of
//!   the batch commits
//! - **Detection ingest**: binds object-detector output to stored messages,
//!   classifies each image and persists the result
//!
//! ## Architecture
//!
//! ```text
//! Fetch Engine            Detection file (JSONL)
//!      │                          │
//!      │ commit_batch             ▼
//!      │                  ┌──────────────┐
//!      │                  │ Detection    │──── classify_image
//!      │                  │ Ingest       │
//!      │                  └──────────────┘
//!      │                          │ attribute_media / upsert
//!      ▼                          ▼
//! ┌─────────────────────────────────────┐
//! │ PgGateway                           │
//! │   validate → tx { rows, checkpoint }│
//! └─────────────────────────────────────┘
//!                  │
//!                  ▼
//!   raw_messages  image_classifications
//!   channel_checkpoints  channels  ingest_runs
//! ```

pub mod config;
pub mod detection_ingest;
pub mod gateway;
pub mod telemetry;
pub mod validate;

pub use config::{Config, ConfigValidationError, DatabaseConfig, LoggingConfig, UpsertMode};
pub use detection_ingest::{DetectionIngest, DetectionIngestOptions, IngestSummary};
pub use gateway::{PgGateway, RunRecord};
