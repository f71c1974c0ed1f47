//! Visual classifier: maps the detections found in one image to a [`Category`].
//!
//! Decision table, evaluated on detections whose confidence is at least the
//! threshold (first match wins):
//!
//! | surviving labels              | category         |
//! |-------------------------------|------------------|
//! | person-like and product-like  | `Promotional`    |
//! | product-like only             | `ProductDisplay` |
//! | person-like only              | `Lifestyle`      |
//! | anything else (incl. empty)   | `Other`          |
//!
//! Labels outside both groups neither produce nor block a category.

use crate::model::{
    Category, ClassificationResult, Confidence, Detection, LabelKind, MessageKey, ObjectLabel,
};
use serde::Deserialize;
use std::collections::{BTreeSet, HashSet};

/// Maps raw model labels to [`LabelKind`]. Matching is case-insensitive.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "LabelCatalogConfig")]
pub struct LabelCatalog {
    person: HashSet<String>,
    product: HashSet<String>,
}

/// Serialized form of [`LabelCatalog`].
#[derive(Debug, Clone, Deserialize)]
pub struct LabelCatalogConfig {
    #[serde(default = "default_person_labels")]
    pub person_labels: Vec<String>,
    #[serde(default = "default_product_labels")]
    pub product_labels: Vec<String>,
}

fn default_person_labels() -> Vec<String> {
    vec!["person".to_string()]
}

fn default_product_labels() -> Vec<String> {
    [
        "bottle",
        "cup",
        "bowl",
        "cell phone",
        "book",
        "vase",
        "scissors",
        "teddy bear",
        "hair drier",
        "toothbrush",
        "remote",
        "keyboard",
        "mouse",
        "laptop",
        "tv",
        "microwave",
        "oven",
        "toaster",
        "sink",
        "refrigerator",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for LabelCatalogConfig {
    fn default() -> Self {
        Self {
            person_labels: default_person_labels(),
            product_labels: default_product_labels(),
        }
    }
}

impl From<LabelCatalogConfig> for LabelCatalog {
    fn from(config: LabelCatalogConfig) -> Self {
        LabelCatalog::new(config.person_labels, config.product_labels)
    }
}

impl Default for LabelCatalog {
    fn default() -> Self {
        LabelCatalogConfig::default().into()
    }
}

impl LabelCatalog {
    pub fn new<P, Q>(person_labels: P, product_labels: Q) -> Self
    where
        P: IntoIterator,
        P::Item: AsRef<str>,
        Q: IntoIterator,
        Q::Item: AsRef<str>,
    {
        Self {
            person: person_labels.into_iter().map(|l| normalize(l.as_ref())).collect(),
            product: product_labels.into_iter().map(|l| normalize(l.as_ref())).collect(),
        }
    }

    /// Group of a raw label. A label listed in both groups counts as a person.
    pub fn kind_of(&self, name: &str) -> LabelKind {
        let name = normalize(name);
        if self.person.contains(&name) {
            LabelKind::Person
        } else if self.product.contains(&name) {
            LabelKind::Product
        } else {
            LabelKind::Other
        }
    }

    pub fn label(&self, name: &str) -> ObjectLabel {
        ObjectLabel {
            name: name.trim().to_string(),
            kind: self.kind_of(name),
        }
    }
}

fn normalize(label: &str) -> String {
    label.trim().to_lowercase()
}

/// Classify one image's detections.
///
/// Total, pure and independent of the iteration order of `detections`.
pub fn classify<'a, I>(detections: I, threshold: Confidence) -> Category
where
    I: IntoIterator<Item = &'a Detection>,
{
    let mut has_person = false;
    let mut has_product = false;

    for detection in detections {
        if detection.confidence < threshold {
            continue;
        }
        match detection.label.kind {
            LabelKind::Person => has_person = true,
            LabelKind::Product => has_product = true,
            LabelKind::Other => {}
        }
    }

    match (has_person, has_product) {
        (true, true) => Category::Promotional,
        (false, true) => Category::ProductDisplay,
        (true, false) => Category::Lifestyle,
        (false, false) => Category::Other,
    }
}

/// Fixed human readable sentence for each category.
pub fn category_description(category: Category) -> &'static str {
    match category {
        Category::Promotional => "Promotional content (person + product)",
        Category::ProductDisplay => "Product display only",
        Category::Lifestyle => "Lifestyle content (person only)",
        Category::Other => "Other content",
    }
}

/// Classify an image and package the result for persistence.
pub fn classify_image(
    image_path: &str,
    source: &MessageKey,
    detections: &[Detection],
    threshold: Confidence,
) -> ClassificationResult {
    let detected_labels: BTreeSet<String> = detections
        .iter()
        .filter(|d| d.confidence >= threshold)
        .map(|d| d.label.name.clone())
        .collect();

    ClassificationResult {
        image_path: image_path.to_string(),
        channel: source.channel.clone(),
        message_id: source.message_id,
        category: classify(detections, threshold),
        threshold,
        detection_count: detections.len() as u32,
        detected_labels: detected_labels.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(value: f32) -> Confidence {
        Confidence::new(value).unwrap()
    }

    fn detection(catalog: &LabelCatalog, label: &str, confidence: f32) -> Detection {
        Detection {
            image_path: "images/chemed123/10.jpg".to_string(),
            label: catalog.label(label),
            confidence: conf(confidence),
            bbox: [0.1, 0.1, 0.4, 0.4],
        }
    }

    #[test]
    fn test_person_and_product_is_promotional() {
        let catalog = LabelCatalog::default();
        let detections = vec![
            detection(&catalog, "person", 0.9),
            detection(&catalog, "bottle", 0.8),
        ];
        assert_eq!(classify(&detections, conf(0.5)), Category::Promotional);
    }

    #[test]
    fn test_product_only_is_product_display() {
        let catalog = LabelCatalog::default();
        let detections = vec![detection(&catalog, "bottle", 0.9)];
        assert_eq!(classify(&detections, conf(0.5)), Category::ProductDisplay);
    }

    #[test]
    fn test_person_only_is_lifestyle() {
        let catalog = LabelCatalog::default();
        let detections = vec![detection(&catalog, "person", 0.9)];
        assert_eq!(classify(&detections, conf(0.5)), Category::Lifestyle);
    }

    #[test]
    fn test_empty_is_other() {
        let detections: Vec<Detection> = vec![];
        assert_eq!(classify(&detections, conf(0.5)), Category::Other);
    }

    #[test]
    fn test_below_threshold_is_filtered_out() {
        let catalog = LabelCatalog::default();
        let detections = vec![detection(&catalog, "person", 0.3)];
        assert_eq!(classify(&detections, conf(0.5)), Category::Other);
    }

    #[test]
    fn test_confidence_equal_to_threshold_survives() {
        let catalog = LabelCatalog::default();
        let detections = vec![detection(&catalog, "cup", 0.5)];
        assert_eq!(classify(&detections, conf(0.5)), Category::ProductDisplay);
    }

    #[test]
    fn test_ignored_labels_neither_produce_nor_block() {
        let catalog = LabelCatalog::default();
        let only_ignored = vec![
            detection(&catalog, "car", 0.95),
            detection(&catalog, "dog", 0.9),
        ];
        assert_eq!(classify(&only_ignored, conf(0.25)), Category::Other);

        let mixed = vec![
            detection(&catalog, "car", 0.95),
            detection(&catalog, "person", 0.9),
        ];
        assert_eq!(classify(&mixed, conf(0.25)), Category::Lifestyle);
    }

    #[test]
    fn test_order_independent_and_repeatable() {
        let catalog = LabelCatalog::default();
        let mut detections = vec![
            detection(&catalog, "laptop", 0.7),
            detection(&catalog, "car", 0.9),
            detection(&catalog, "person", 0.2),
            detection(&catalog, "person", 0.6),
        ];
        let expected = classify(&detections, conf(0.5));
        assert_eq!(expected, Category::Promotional);

        for _ in 0..detections.len() {
            detections.rotate_left(1);
            assert_eq!(classify(&detections, conf(0.5)), expected);
        }
        detections.reverse();
        assert_eq!(classify(&detections, conf(0.5)), expected);
    }

    #[test]
    fn test_catalog_is_case_insensitive() {
        let catalog = LabelCatalog::default();
        assert_eq!(catalog.kind_of("Person"), LabelKind::Person);
        assert_eq!(catalog.kind_of(" Cell Phone "), LabelKind::Product);
        assert_eq!(catalog.kind_of("giraffe"), LabelKind::Other);
    }

    #[test]
    fn test_custom_catalog() {
        let catalog = LabelCatalog::new(["pharmacist"], ["pill_box", "syringe"]);
        assert_eq!(catalog.kind_of("pharmacist"), LabelKind::Person);
        assert_eq!(catalog.kind_of("syringe"), LabelKind::Product);
        assert_eq!(catalog.kind_of("person"), LabelKind::Other);
    }

    #[test]
    fn test_classify_image_is_deterministic() {
        let catalog = LabelCatalog::default();
        let source = MessageKey {
            channel: "chemed123".to_string(),
            message_id: 10,
        };
        let detections = vec![
            detection(&catalog, "bottle", 0.8),
            detection(&catalog, "person", 0.9),
            detection(&catalog, "bottle", 0.7),
            detection(&catalog, "dog", 0.1),
        ];

        let first = classify_image("images/chemed123/10.jpg", &source, &detections, conf(0.5));
        let mut reversed = detections.clone();
        reversed.reverse();
        let second = classify_image("images/chemed123/10.jpg", &source, &reversed, conf(0.5));

        assert_eq!(first, second);
        assert_eq!(first.category, Category::Promotional);
        assert_eq!(first.detection_count, 4);
        assert_eq!(first.detected_labels, vec!["bottle", "person"]);
        assert_eq!(first.message_id, 10);
    }

    #[test]
    fn test_category_descriptions() {
        assert_eq!(
            category_description(Category::Promotional),
            "Promotional content (person + product)"
        );
        assert_eq!(category_description(Category::ProductDisplay), "Product display only");
        assert_eq!(
            category_description(Category::Lifestyle),
            "Lifestyle content (person only)"
        );
        assert_eq!(category_description(Category::Other), "Other content");
    }

    #[test]
    fn test_catalog_deserializes_with_defaults() {
        let catalog: LabelCatalog = serde_json::from_str(r#"{"product_labels": ["pill_box"]}"#).unwrap();
        assert_eq!(catalog.kind_of("person"), LabelKind::Person);
        assert_eq!(catalog.kind_of("pill_box"), LabelKind::Product);
        assert_eq!(catalog.kind_of("bottle"), LabelKind::Other);
    }
}
