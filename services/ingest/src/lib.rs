//! Medlens Ingest
//!
//! Pulls messages and photos from external channels and commits them through
//! the persistence gateway, resuming from per-channel checkpoints.
//!
//! # Architecture
//!
//! ```text
//!                     ┌─ fetch worker (channel A) ─┐
//! ChannelSource ──────┼─ fetch worker (channel B) ─┼──▶ CommitQueue ──▶ PgGateway
//!  (session gate)     └─ fetch worker (channel C) ─┘    (N workers)     (tx: rows + checkpoint)
//! ```

pub mod commit_queue;
pub mod config;
pub mod fetcher;
pub mod http_source;
pub mod media_store;
pub mod raw_archive;
pub mod runner;
pub mod source;

pub use commit_queue::{CommitHandle, CommitQueue};
pub use config::IngestConfig;
pub use fetcher::{ChannelFetcher, FetchOptions, FetchedBatch};
pub use http_source::HttpChannelSource;
pub use media_store::MediaStore;
pub use raw_archive::RawArchive;
pub use runner::{ChannelOutcome, ChannelStatus, IngestRunner, RunReport};
pub use source::{ChannelInfo, ChannelSource, MediaKind, MediaPayload, SourceMessage};
