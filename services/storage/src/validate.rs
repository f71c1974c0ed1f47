//! Pure row validation run before a batch enters its transaction.

use medlens_pipeline::model::validate_handle;
use medlens_pipeline::{ClassificationResult, RawMessage, Record, RejectedRow, ValidationError};
use tracing::warn;

/// Check one fetched message.
pub fn validate_message(message: &RawMessage) -> Result<(), ValidationError> {
    validate_handle(&message.channel)?;

    if message.message_id <= 0 {
        return Err(ValidationError::MalformedKey(format!(
            "message id must be positive, got {}",
            message.message_id
        )));
    }
    if message.views < 0 {
        return Err(ValidationError::OutOfRange {
            field: "views",
            value: message.views.to_string(),
        });
    }
    if message.forwards < 0 {
        return Err(ValidationError::OutOfRange {
            field: "forwards",
            value: message.forwards.to_string(),
        });
    }
    // PostgreSQL text columns cannot hold NUL
    if message.text.contains('\0') {
        return Err(ValidationError::InvalidField {
            field: "text",
            message: "contains NUL byte".to_string(),
        });
    }
    if message.media_path.is_some() && !message.has_media {
        return Err(ValidationError::InvalidField {
            field: "media_path",
            message: "set on a message without media".to_string(),
        });
    }
    Ok(())
}

/// Check one classification result.
pub fn validate_classification(result: &ClassificationResult) -> Result<(), ValidationError> {
    if result.image_path.trim().is_empty() {
        return Err(ValidationError::MalformedKey("empty image path".to_string()));
    }
    if result.image_path.contains('\0') {
        return Err(ValidationError::InvalidField {
            field: "image_path",
            message: "contains NUL byte".to_string(),
        });
    }
    validate_handle(&result.channel)?;
    if result.message_id <= 0 {
        return Err(ValidationError::MalformedKey(format!(
            "message id must be positive, got {}",
            result.message_id
        )));
    }
    let threshold = result.threshold.value();
    if !(0.0..=1.0).contains(&threshold) {
        return Err(ValidationError::OutOfRange {
            field: "threshold",
            value: threshold.to_string(),
        });
    }
    Ok(())
}

pub fn validate_record(record: &Record) -> Result<(), ValidationError> {
    match record {
        Record::Message(m) => validate_message(m),
        Record::Classification(c) => validate_classification(c),
    }
}

/// Split a batch into valid records and rejected rows, preserving order.
pub fn partition(batch: Vec<Record>) -> (Vec<Record>, Vec<RejectedRow>) {
    let mut valid = Vec::with_capacity(batch.len());
    let mut rejected = Vec::new();

    for record in batch {
        match validate_record(&record) {
            Ok(()) => valid.push(record),
            Err(reason) => {
                let key = record.key_label();
                warn!(key = %key, reason = %reason, "Row failed validation, excluded from batch");
                metrics::counter!("medlens.gateway.rows_rejected", "stage" => "validation")
                    .increment(1);
                rejected.push(RejectedRow { key, reason });
            }
        }
    }

    (valid, rejected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use medlens_pipeline::{Category, Confidence};

    fn message(channel: &str, id: i64) -> RawMessage {
        RawMessage {
            channel: channel.to_string(),
            message_id: id,
            posted_at: Utc::now(),
            text: "Paracetamol 500mg in stock".to_string(),
            views: 120,
            forwards: 3,
            has_media: false,
            media_path: None,
            ingested_at: Utc::now(),
        }
    }

    fn classification(path: &str) -> ClassificationResult {
        ClassificationResult {
            image_path: path.to_string(),
            channel: "chemed123".to_string(),
            message_id: 7,
            category: Category::Other,
            threshold: Confidence::new(0.25).unwrap(),
            detection_count: 0,
            detected_labels: vec![],
        }
    }

    #[test]
    fn test_valid_message() {
        assert!(validate_message(&message("chemed123", 1)).is_ok());
    }

    #[test]
    fn test_message_rejections() {
        assert!(validate_message(&message("bad channel", 1)).is_err());
        assert!(validate_message(&message("chemed123", 0)).is_err());

        let mut negative = message("chemed123", 2);
        negative.views = -1;
        assert!(matches!(
            validate_message(&negative),
            Err(ValidationError::OutOfRange { field: "views", .. })
        ));

        let mut nul = message("chemed123", 3);
        nul.text = "a\0b".to_string();
        assert!(validate_message(&nul).is_err());

        let mut orphan_media = message("chemed123", 4);
        orphan_media.media_path = Some("data/raw/images/chemed123/4.jpg".to_string());
        assert!(validate_message(&orphan_media).is_err());
        orphan_media.has_media = true;
        assert!(validate_message(&orphan_media).is_ok());
    }

    #[test]
    fn test_classification_rejections() {
        assert!(validate_classification(&classification("images/a.jpg")).is_ok());
        assert!(validate_classification(&classification("  ")).is_err());
    }

    #[test]
    fn test_partition_keeps_order_and_reports_rejects() {
        let batch: Vec<Record> = vec![
            message("chemed123", 1).into(),
            message("chemed123", -5).into(),
            classification("").into(),
            message("chemed123", 2).into(),
        ];

        let (valid, rejected) = partition(batch);

        assert_eq!(valid.len(), 2);
        assert_eq!(valid[0].key_label(), "message:chemed123/1");
        assert_eq!(valid[1].key_label(), "message:chemed123/2");
        assert_eq!(rejected.len(), 2);
        assert_eq!(rejected[0].key, "message:chemed123/-5");
        assert_eq!(rejected[1].key, "classification:");
    }
}
