//! Records flowing between the fetch engine, the classifier and the gateway.

use crate::error::ValidationError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum length of a channel handle.
pub const MAX_HANDLE_LEN: usize = 64;

/// A tracked external channel. Immutable once registered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Stable identifier (username without the leading `@`)
    pub handle: String,
    /// Human readable title
    #[serde(default)]
    pub display_name: String,
    /// Free-form category tag (e.g. "pharmacy", "cosmetics")
    #[serde(default)]
    pub category: String,
}

impl Channel {
    pub fn new(
        handle: impl Into<String>,
        display_name: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            handle: normalize_handle(&handle.into()),
            display_name: display_name.into(),
            category: category.into(),
        }
    }
}

/// Strip surrounding whitespace and a leading `@`.
pub fn normalize_handle(raw: &str) -> String {
    raw.trim().trim_start_matches('@').to_string()
}

/// Check that a handle is `[A-Za-z0-9_]{1,64}`.
pub fn validate_handle(handle: &str) -> Result<(), ValidationError> {
    if handle.is_empty() || handle.len() > MAX_HANDLE_LEN {
        return Err(ValidationError::MalformedKey(format!(
            "channel handle must be 1-{} characters, got {:?}",
            MAX_HANDLE_LEN, handle
        )));
    }
    if !handle
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(ValidationError::MalformedKey(format!(
            "channel handle contains invalid characters: {:?}",
            handle
        )));
    }
    Ok(())
}

/// Composite key of a stored message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKey {
    pub channel: String,
    pub message_id: i64,
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel, self.message_id)
    }
}

/// A message as fetched from a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawMessage {
    pub channel: String,
    pub message_id: i64,
    pub posted_at: DateTime<Utc>,
    pub text: String,
    pub views: i64,
    pub forwards: i64,
    pub has_media: bool,
    /// Local path of the downloaded media artifact, if any
    pub media_path: Option<String>,
    pub ingested_at: DateTime<Utc>,
}

impl RawMessage {
    pub fn key(&self) -> MessageKey {
        MessageKey {
            channel: self.channel.clone(),
            message_id: self.message_id,
        }
    }
}

/// Durable per-channel cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub channel: String,
    pub last_message_id: i64,
    pub updated_at: DateTime<Utc>,
}

/// Request to move a channel's checkpoint forward, committed with a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointAdvance {
    pub channel: String,
    pub to: i64,
}

/// Detection confidence, guaranteed to lie in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "f32", into = "f32")]
pub struct Confidence(f32);

impl Confidence {
    pub fn new(value: f32) -> Result<Self, ValidationError> {
        if value.is_finite() && (0.0..=1.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(ValidationError::OutOfRange {
                field: "confidence",
                value: value.to_string(),
            })
        }
    }

    pub fn value(&self) -> f32 {
        self.0
    }
}

impl TryFrom<f32> for Confidence {
    type Error = ValidationError;

    fn try_from(value: f32) -> Result<Self, Self::Error> {
        Confidence::new(value)
    }
}

impl From<Confidence> for f32 {
    fn from(confidence: Confidence) -> Self {
        confidence.0
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}", self.0)
    }
}

/// Classification group of a detected object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelKind {
    Person,
    Product,
    Other,
}

/// A raw model label together with its group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLabel {
    pub name: String,
    pub kind: LabelKind,
}

/// One object found in one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub image_path: String,
    pub label: ObjectLabel,
    pub confidence: Confidence,
    /// Bounding box `[x, y, width, height]`; not interpreted by the classifier
    pub bbox: [f32; 4],
}

/// Business category assigned to an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Promotional,
    ProductDisplay,
    Lifestyle,
    Other,
}

impl Category {
    pub const ALL: [Category; 4] = [
        Category::Promotional,
        Category::ProductDisplay,
        Category::Lifestyle,
        Category::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Promotional => "promotional",
            Category::ProductDisplay => "product_display",
            Category::Lifestyle => "lifestyle",
            Category::Other => "other",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| ValidationError::InvalidField {
                field: "category",
                message: format!("unknown category {:?}", s),
            })
    }
}

/// Classifier output for one image, attributed to its source message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub image_path: String,
    pub channel: String,
    pub message_id: i64,
    pub category: Category,
    pub threshold: Confidence,
    /// Number of detections handed to the classifier (before filtering)
    pub detection_count: u32,
    /// Sorted, de-duplicated labels that survived the threshold
    pub detected_labels: Vec<String>,
}

impl ClassificationResult {
    pub fn message_key(&self) -> MessageKey {
        MessageKey {
            channel: self.channel.clone(),
            message_id: self.message_id,
        }
    }
}

/// Element of a gateway batch.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Message(RawMessage),
    Classification(ClassificationResult),
}

impl Record {
    /// Human readable key used in logs and rejection reports.
    pub fn key_label(&self) -> String {
        match self {
            Record::Message(m) => format!("message:{}", m.key()),
            Record::Classification(c) => format!("classification:{}", c.image_path),
        }
    }
}

impl From<RawMessage> for Record {
    fn from(message: RawMessage) -> Self {
        Record::Message(message)
    }
}

impl From<ClassificationResult> for Record {
    fn from(result: ClassificationResult) -> Self {
        Record::Classification(result)
    }
}

/// A row excluded from a batch.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectedRow {
    pub key: String,
    pub reason: ValidationError,
}

/// Result of one committed gateway batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsertReport {
    pub committed: usize,
    pub rejected: Vec<RejectedRow>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_bounds() {
        assert!(Confidence::new(0.0).is_ok());
        assert!(Confidence::new(1.0).is_ok());
        assert!(Confidence::new(0.42).is_ok());
        assert!(Confidence::new(-0.01).is_err());
        assert!(Confidence::new(1.01).is_err());
        assert!(Confidence::new(f32::NAN).is_err());
    }

    #[test]
    fn test_confidence_deserialize_rejects_out_of_range() {
        let ok: Confidence = serde_json::from_str("0.75").unwrap();
        assert_eq!(ok.value(), 0.75);
        assert!(serde_json::from_str::<Confidence>("1.5").is_err());
    }

    #[test]
    fn test_category_round_trip_names() {
        for category in Category::ALL {
            assert_eq!(category.as_str().parse::<Category>().unwrap(), category);
        }
        assert!("unknown".parse::<Category>().is_err());
        assert_eq!(
            serde_json::to_string(&Category::ProductDisplay).unwrap(),
            "\"product_display\""
        );
    }

    #[test]
    fn test_handle_validation() {
        assert!(validate_handle("CheMed123").is_ok());
        assert!(validate_handle("lobelia4cosmetics").is_ok());
        assert!(validate_handle("").is_err());
        assert!(validate_handle("bad handle").is_err());
        assert!(validate_handle("../etc").is_err());
        assert!(validate_handle(&"a".repeat(65)).is_err());
    }

    #[test]
    fn test_channel_normalizes_handle() {
        let channel = Channel::new(" @tikvahpharma ", "Tikvah Pharma", "pharmacy");
        assert_eq!(channel.handle, "tikvahpharma");
    }

    #[test]
    fn test_record_key_label() {
        let message = RawMessage {
            channel: "yenehealth".to_string(),
            message_id: 42,
            posted_at: Utc::now(),
            text: String::new(),
            views: 0,
            forwards: 0,
            has_media: false,
            media_path: None,
            ingested_at: Utc::now(),
        };
        assert_eq!(Record::from(message).key_label(), "message:yenehealth/42");
    }
}
