//! Detection ingest: binds object-detector output to persisted messages.
//!
//! Input is a JSON Lines file, one object per detected object:
//!
//! ```text
//! {"image_path": "data/raw/images/chemed123/10.jpg", "label": "bottle", "confidence": 0.81, "bbox": [12, 40, 200, 310]}
//! {"image_path": "data/raw/images/chemed123/11.jpg", "label": null, "confidence": null}
//! ```
//!
//! A row whose `label` is null marks an image the detector processed without
//! finding anything, so the image still classifies (as `Other`).

use medlens_pipeline::{
    classify_image, Category, Confidence, Detection, Failure, LabelCatalog, MessageKey, Record,
    RecordStore, RejectedRow,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::string::FromUtf8Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, instrument, warn};

/// One line of the detection file
#[derive(Debug, Clone, Deserialize)]
pub struct DetectionRow {
    pub image_path: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub confidence: Option<f32>,
    #[serde(default)]
    pub bbox: [f32; 4],
}

/// Detections of a single image, keyed by normalized path
#[derive(Debug, Clone, Default)]
pub struct ImageDetections {
    pub image_path: String,
    pub detections: Vec<Detection>,
}

/// Parsed detection file
#[derive(Debug, Default)]
pub struct ParsedDetections {
    pub images: BTreeMap<String, ImageDetections>,
    pub rows_read: usize,
    pub malformed_rows: usize,
}

/// Outcome of one detection ingest
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestSummary {
    pub rows_read: usize,
    pub malformed_rows: usize,
    pub images: usize,
    pub unattributed: usize,
    pub classified: usize,
    pub committed: usize,
    pub rejected: usize,
    /// Committed images per category
    pub per_category: BTreeMap<Category, usize>,
}

/// Settings for [`DetectionIngest`]
#[derive(Debug, Clone)]
pub struct DetectionIngestOptions {
    pub threshold: Confidence,
    pub batch_size: usize,
    pub catalog: LabelCatalog,
}

/// Strip a leading `./` so paths match the stored `media_path` values.
pub fn normalize_image_path(path: &str) -> String {
    let mut path = path.trim();
    while let Some(rest) = path.strip_prefix("./") {
        path = rest;
    }
    path.to_string()
}

impl ParsedDetections {
    /// Add one line of the detection file. Malformed rows are logged and counted.
    pub fn push_line(&mut self, line_no: usize, line: &str, catalog: &LabelCatalog) {
        if line.trim().is_empty() {
            return;
        }
        self.rows_read += 1;

        let row: DetectionRow = match serde_json::from_str(line) {
            Ok(row) => row,
            Err(e) => {
                warn!(line = line_no, error = %e, "Malformed detection row");
                self.malformed_rows += 1;
                return;
            }
        };

        let image_path = normalize_image_path(&row.image_path);
        if image_path.is_empty() {
            warn!(line = line_no, "Detection row without image path");
            self.malformed_rows += 1;
            return;
        }

        let detection = match (row.label, row.confidence) {
            (None, _) => None,
            (Some(label), Some(confidence)) => match Confidence::new(confidence) {
                Ok(confidence) => Some(Detection {
                    image_path: image_path.clone(),
                    label: catalog.label(&label),
                    confidence,
                    bbox: row.bbox,
                }),
                Err(e) => {
                    warn!(line = line_no, error = %e, "Detection confidence out of range");
                    self.malformed_rows += 1;
                    return;
                }
            },
            (Some(label), None) => {
                warn!(line = line_no, label = %label, "Detection row without confidence");
                self.malformed_rows += 1;
                return;
            }
        };

        let entry = self
            .images
            .entry(image_path.clone())
            .or_insert_with(|| ImageDetections {
                image_path,
                detections: Vec::new(),
            });
        if let Some(detection) = detection {
            entry.detections.push(detection);
        }
    }

    /// Count a line that is not valid UTF-8.
    fn push_undecodable(&mut self, line_no: usize, error: &FromUtf8Error) {
        warn!(line = line_no, error = %error, "Detection row is not valid UTF-8");
        self.rows_read += 1;
        self.malformed_rows += 1;
    }
}

/// Parse and group detection rows. Malformed rows are logged and skipped.
pub fn parse_detections<'a, I>(lines: I, catalog: &LabelCatalog) -> ParsedDetections
where
    I: IntoIterator<Item = &'a str>,
{
    let mut parsed = ParsedDetections::default();
    for (idx, line) in lines.into_iter().enumerate() {
        parsed.push_line(idx + 1, line, catalog);
    }
    parsed
}

/// Strip the line terminator (`\n` or `\r\n`) from a raw line.
fn trim_line_end(raw: &mut Vec<u8>) {
    if raw.last() == Some(&b'\n') {
        raw.pop();
        if raw.last() == Some(&b'\r') {
            raw.pop();
        }
    }
}

/// Classifies detector output and persists it through a [`RecordStore`]
pub struct DetectionIngest<S> {
    store: S,
    options: DetectionIngestOptions,
}

impl<S: RecordStore> DetectionIngest<S> {
    pub fn new(store: S, options: DetectionIngestOptions) -> Self {
        Self { store, options }
    }

    /// Read `path` and ingest its detections
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn ingest_file(&self, path: &Path) -> Result<IngestSummary, Failure> {
        let file = File::open(path).await.map_err(|e| {
            Failure::fatal(format!("cannot open detection file {}: {}", path.display(), e))
        })?;

        let mut reader = BufReader::new(file);
        let mut parsed = ParsedDetections::default();
        let mut raw = Vec::new();
        let mut line_no = 0;
        loop {
            raw.clear();
            let read = reader
                .read_until(b'\n', &mut raw)
                .await
                .map_err(|e| Failure::fatal(format!("cannot read detection file: {}", e)))?;
            if read == 0 {
                break;
            }
            line_no += 1;
            trim_line_end(&mut raw);

            match String::from_utf8(std::mem::take(&mut raw)) {
                Ok(line) => parsed.push_line(line_no, &line, &self.options.catalog),
                Err(e) => parsed.push_undecodable(line_no, &e),
            }
        }

        self.ingest(parsed).await
    }

    /// Attribute, classify and upsert already parsed detections
    pub async fn ingest(&self, parsed: ParsedDetections) -> Result<IngestSummary, Failure> {
        let mut summary = IngestSummary {
            rows_read: parsed.rows_read,
            malformed_rows: parsed.malformed_rows,
            images: parsed.images.len(),
            ..Default::default()
        };

        let paths: Vec<String> = parsed.images.keys().cloned().collect();
        let owners: HashMap<String, MessageKey> = self.store.attribute_media(&paths).await?;

        let mut results = Vec::with_capacity(parsed.images.len());
        for (path, image) in &parsed.images {
            let Some(owner) = owners.get(path) else {
                warn!(image_path = %path, "No message carries this image, skipping");
                summary.unattributed += 1;
                continue;
            };

            let result = classify_image(&image.image_path, owner, &image.detections, self.options.threshold);
            debug!(
                image_path = %path,
                message = %owner,
                category = %result.category,
                "Image classified"
            );
            results.push(Record::from(result));
        }
        summary.classified = results.len();

        metrics::counter!("medlens.classify.unattributed").increment(summary.unattributed as u64);

        let batch_size = self.options.batch_size.max(1);
        let mut pending = results.into_iter().peekable();
        while pending.peek().is_some() {
            let batch: Vec<Record> = pending.by_ref().take(batch_size).collect();
            let categories: Vec<(String, Category)> = batch
                .iter()
                .filter_map(|record| match record {
                    Record::Classification(c) => Some((record.key_label(), c.category)),
                    Record::Message(_) => None,
                })
                .collect();

            let report = self.store.upsert(batch).await?;
            summary.committed += report.committed;
            summary.rejected += report.rejected.len();
            log_rejections(&report.rejected);

            let rejected: HashSet<&str> = report.rejected.iter().map(|r| r.key.as_str()).collect();
            for (key, category) in categories {
                if !rejected.contains(key.as_str()) {
                    *summary.per_category.entry(category).or_default() += 1;
                }
            }
        }

        for (category, count) in &summary.per_category {
            metrics::counter!("medlens.classify.images", "category" => category.as_str())
                .increment(*count as u64);
        }

        info!(
            rows_read = summary.rows_read,
            malformed_rows = summary.malformed_rows,
            images = summary.images,
            unattributed = summary.unattributed,
            classified = summary.classified,
            committed = summary.committed,
            rejected = summary.rejected,
            "Detection ingest completed"
        );

        Ok(summary)
    }
}

fn log_rejections(rejected: &[RejectedRow]) {
    for row in rejected {
        warn!(key = %row.key, reason = %row.reason, "Classification not stored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medlens_pipeline::store::async_trait;
    use medlens_pipeline::{CheckpointAdvance, RawMessage, UpsertReport, ValidationError};
    use mockall::mock;
    use std::io::Write;

    mock! {
        pub Store {}

        #[async_trait]
        impl RecordStore for Store {
            async fn upsert(&self, batch: Vec<Record>) -> Result<UpsertReport, Failure>;
            async fn commit_batch(
                &self,
                batch: Vec<RawMessage>,
                advance: CheckpointAdvance,
            ) -> Result<UpsertReport, Failure>;
            async fn attribute_media(&self, paths: &[String]) -> Result<HashMap<String, MessageKey>, Failure>;
        }
    }

    fn options(batch_size: usize) -> DetectionIngestOptions {
        DetectionIngestOptions {
            threshold: Confidence::new(0.5).unwrap(),
            batch_size,
            catalog: LabelCatalog::default(),
        }
    }

    fn key(channel: &str, id: i64) -> MessageKey {
        MessageKey {
            channel: channel.to_string(),
            message_id: id,
        }
    }

    const DETECTIONS: &str = r#"
{"image_path": "./data/raw/images/chemed123/10.jpg", "label": "person", "confidence": 0.91, "bbox": [0, 0, 10, 10]}
{"image_path": "data/raw/images/chemed123/10.jpg", "label": "bottle", "confidence": 0.84}
{"image_path": "data/raw/images/chemed123/11.jpg", "label": "person", "confidence": 0.30}
{"image_path": "data/raw/images/chemed123/12.jpg", "label": null, "confidence": null}
{"image_path": "data/raw/images/lobelia4cosmetics/7.jpg", "label": "cup", "confidence": 0.77}
{"image_path": "data/raw/images/unknown/1.jpg", "label": "laptop", "confidence": 0.95}
not json at all
{"image_path": "data/raw/images/chemed123/13.jpg", "label": "person", "confidence": 1.7}
"#;

    #[test]
    fn test_normalize_image_path() {
        assert_eq!(normalize_image_path("./a/b.jpg"), "a/b.jpg");
        assert_eq!(normalize_image_path("././a/b.jpg"), "a/b.jpg");
        assert_eq!(normalize_image_path(" a/b.jpg "), "a/b.jpg");
    }

    #[test]
    fn test_parse_groups_by_normalized_path() {
        let parsed = parse_detections(DETECTIONS.lines(), &LabelCatalog::default());

        assert_eq!(parsed.rows_read, 8);
        assert_eq!(parsed.malformed_rows, 2);
        assert_eq!(parsed.images.len(), 5);

        let first = &parsed.images["data/raw/images/chemed123/10.jpg"];
        assert_eq!(first.detections.len(), 2);

        let empty = &parsed.images["data/raw/images/chemed123/12.jpg"];
        assert!(empty.detections.is_empty());
        assert!(!parsed.images.contains_key("data/raw/images/chemed123/13.jpg"));
    }

    #[tokio::test]
    async fn test_ingest_classifies_attributed_images() {
        let mut store = MockStore::new();
        store.expect_attribute_media().times(1).returning(|paths| {
            let mut owners = HashMap::new();
            for path in paths {
                let owner = match path.as_str() {
                    "data/raw/images/chemed123/10.jpg" => key("chemed123", 10),
                    "data/raw/images/chemed123/11.jpg" => key("chemed123", 11),
                    "data/raw/images/chemed123/12.jpg" => key("chemed123", 12),
                    "data/raw/images/lobelia4cosmetics/7.jpg" => key("lobelia4cosmetics", 7),
                    _ => continue,
                };
                owners.insert(path.clone(), owner);
            }
            Ok(owners)
        });
        store
            .expect_upsert()
            .withf(|batch| batch.len() <= 3)
            .times(2)
            .returning(|batch| {
                Ok(UpsertReport {
                    committed: batch.len(),
                    rejected: vec![],
                })
            });

        let ingest = DetectionIngest::new(store, options(3));
        let parsed = parse_detections(DETECTIONS.lines(), &LabelCatalog::default());
        let summary = ingest.ingest(parsed).await.unwrap();

        assert_eq!(summary.images, 5);
        assert_eq!(summary.unattributed, 1);
        assert_eq!(summary.classified, 4);
        assert_eq!(summary.committed, 4);
        assert_eq!(summary.per_category.get(&Category::Promotional), Some(&1));
        assert_eq!(summary.per_category.get(&Category::ProductDisplay), Some(&1));
        assert_eq!(summary.per_category.get(&Category::Other), Some(&2));
        assert_eq!(summary.per_category.get(&Category::Lifestyle), None);
    }

    #[tokio::test]
    async fn test_ingest_file_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{"image_path": "data/raw/images/yenehealth/3.jpg", "label": "person", "confidence": 0.66}}"#
        )
        .unwrap();

        let mut store = MockStore::new();
        store.expect_attribute_media().returning(|paths| {
            Ok(paths
                .iter()
                .map(|p| (p.clone(), key("yenehealth", 3)))
                .collect())
        });
        store
            .expect_upsert()
            .withf(|batch| match batch.as_slice() {
                [Record::Classification(c)] => c.category == Category::Lifestyle && c.message_id == 3,
                _ => false,
            })
            .times(1)
            .returning(|batch| {
                Ok(UpsertReport {
                    committed: batch.len(),
                    rejected: vec![],
                })
            });

        let ingest = DetectionIngest::new(store, options(100));
        let summary = ingest.ingest_file(file.path()).await.unwrap();
        assert_eq!(summary.committed, 1);
        assert_eq!(summary.per_category.get(&Category::Lifestyle), Some(&1));
    }

    #[tokio::test]
    async fn test_undecodable_line_is_counted_as_malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            b"{\"image_path\": \"data/raw/images/chemed123/20.jpg\", \"label\": \"bottle\", \"confidence\": 0.9}\n",
        )
        .unwrap();
        file.write_all(b"{\"image_path\": \"\xFF\xFE.jpg\"}\r\n").unwrap();
        file.write_all(
            b"{\"image_path\": \"data/raw/images/chemed123/21.jpg\", \"label\": \"person\", \"confidence\": 0.8}",
        )
        .unwrap();

        let mut store = MockStore::new();
        store.expect_attribute_media().returning(|paths| {
            Ok(paths
                .iter()
                .enumerate()
                .map(|(i, p)| (p.clone(), key("chemed123", 20 + i as i64)))
                .collect())
        });
        store.expect_upsert().times(1).returning(|batch| {
            Ok(UpsertReport {
                committed: batch.len(),
                rejected: vec![],
            })
        });

        let ingest = DetectionIngest::new(store, options(100));
        let summary = ingest.ingest_file(file.path()).await.unwrap();

        assert_eq!(summary.rows_read, 3);
        assert_eq!(summary.malformed_rows, 1);
        assert_eq!(summary.images, 2);
        assert_eq!(summary.committed, 2);
    }

    #[tokio::test]
    async fn test_rejected_rows_are_not_counted_per_category() {
        let mut store = MockStore::new();
        store.expect_attribute_media().returning(|paths| {
            Ok(paths
                .iter()
                .enumerate()
                .map(|(i, p)| (p.clone(), key("chemed123", 30 + i as i64)))
                .collect())
        });
        store.expect_upsert().times(1).returning(|batch| {
            let rejected: Vec<RejectedRow> = batch
                .iter()
                .filter(|r| matches!(r, Record::Classification(c) if c.category == Category::Promotional))
                .map(|r| RejectedRow {
                    key: r.key_label(),
                    reason: ValidationError::Rejected("23503".to_string()),
                })
                .collect();
            Ok(UpsertReport {
                committed: batch.len() - rejected.len(),
                rejected,
            })
        });

        let lines = [
            r#"{"image_path": "data/raw/images/chemed123/30.jpg", "label": "person", "confidence": 0.9}"#,
            r#"{"image_path": "data/raw/images/chemed123/30.jpg", "label": "bottle", "confidence": 0.9}"#,
            r#"{"image_path": "data/raw/images/chemed123/31.jpg", "label": "person", "confidence": 0.9}"#,
        ];
        let parsed = parse_detections(lines.into_iter(), &LabelCatalog::default());
        let ingest = DetectionIngest::new(store, options(100));
        let summary = ingest.ingest(parsed).await.unwrap();

        assert_eq!(summary.classified, 2);
        assert_eq!(summary.committed, 1);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.per_category.get(&Category::Promotional), None);
        assert_eq!(summary.per_category.get(&Category::Lifestyle), Some(&1));
    }

    #[tokio::test]
    async fn test_missing_file_is_fatal() {
        let store = MockStore::new();
        let ingest = DetectionIngest::new(store, options(10));
        let err = ingest
            .ingest_file(Path::new("/nonexistent/detections.jsonl"))
            .await
            .unwrap_err();
        assert!(matches!(err, Failure::Fatal(_)));
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let mut store = MockStore::new();
        store
            .expect_attribute_media()
            .returning(|_| Err(Failure::fatal("save failed after 5 attempts")));
        store.expect_upsert().never();

        let ingest = DetectionIngest::new(store, options(10));
        let parsed = parse_detections(DETECTIONS.lines(), &LabelCatalog::default());
        assert!(ingest.ingest(parsed).await.is_err());
    }
}
