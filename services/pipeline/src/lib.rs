//! Medlens Pipeline - shared core for channel ingest and image classification
//!
//! This library holds the pieces the ingest and storage services agree on:
//!
//! - The record model (messages, checkpoints, detections, classifications)
//! - The failure taxonomy and the retry policy that dispatches on it
//! - The visual classifier
//! - The storage traits implemented by the PostgreSQL gateway
//!
//! # Example
//!
//! ```rust
//! use medlens_pipeline::{classify, Confidence, Detection, LabelCatalog, Category};
//!
//! let catalog = LabelCatalog::default();
//! let detections = vec![Detection {
//!     image_path: "data/raw/images/chemed123/10.jpg".to_string(),
//!     label: catalog.label("bottle"),
//!     confidence: Confidence::new(0.8).unwrap(),
//!     bbox: [0.0, 0.0, 1.0, 1.0],
//! }];
//!
//! let threshold = Confidence::new(0.5).unwrap();
//! assert_eq!(classify(&detections, threshold), Category::ProductDisplay);
//! ```

pub mod classifier;
pub mod error;
pub mod model;
pub mod retry;
pub mod store;

// Re-export main types
pub use classifier::{category_description, classify, classify_image, LabelCatalog};
pub use error::{Failure, FailureKind, ValidationError};
pub use model::{
    Category, Channel, Checkpoint, CheckpointAdvance, ClassificationResult, Confidence,
    Detection, LabelKind, MessageKey, ObjectLabel, RawMessage, Record, RejectedRow,
    UpsertReport,
};
pub use retry::{RetryConfig, RetryPolicy};
pub use store::{async_trait, CheckpointStore, RecordStore};
