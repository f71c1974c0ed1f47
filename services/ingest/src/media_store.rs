//! Local storage for downloaded media.
//!
//! Layout: `{media_dir}/{channel}/{message_id}.{ext}`. The stored path string
//! is what ends up in `raw_messages.media_path` and what detection rows are
//! matched against.

use crate::source::MediaPayload;
use medlens_pipeline::Failure;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Destination of a message's media file.
    pub fn path_for(&self, channel: &str, message_id: i64, content_type: Option<&str>) -> PathBuf {
        self.root
            .join(sanitize_path_component(channel))
            .join(format!("{}.{}", message_id, extension_for(content_type)))
    }

    /// Write a payload and return the stored path.
    ///
    /// The file is written under a temporary name and renamed into place, so
    /// a reader never sees a partial image.
    pub async fn save(
        &self,
        channel: &str,
        message_id: i64,
        payload: &MediaPayload,
    ) -> Result<String, Failure> {
        let path = self.path_for(channel, message_id, payload.content_type.as_deref());
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Failure::fatal(format!("cannot create {}: {}", parent.display(), e)))?;
        }

        let partial = path.with_extension("part");
        tokio::fs::write(&partial, &payload.bytes)
            .await
            .map_err(|e| Failure::fatal(format!("cannot write {}: {}", partial.display(), e)))?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| Failure::fatal(format!("cannot move {}: {}", path.display(), e)))?;

        debug!(path = %path.display(), bytes = payload.bytes.len(), "Media stored");
        Ok(path_string(&path))
    }
}

/// Forward-slash path string, stable across platforms.
fn path_string(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

/// Sanitize a path component for filesystem use
pub(crate) fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' => c,
            _ => '_',
        })
        .collect()
}

/// File extension for a media content type. Photos default to jpg.
fn extension_for(content_type: Option<&str>) -> &'static str {
    let mime = content_type
        .and_then(|c| c.split(';').next())
        .map(|c| c.trim().to_lowercase());
    match mime.as_deref() {
        Some("image/png") => "png",
        Some("image/webp") => "webp",
        Some("image/gif") => "gif",
        Some("video/mp4") => "mp4",
        _ => "jpg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_layout() {
        let store = MediaStore::new("data/raw/images");
        assert_eq!(
            path_string(&store.path_for("chemed123", 10, None)),
            "data/raw/images/chemed123/10.jpg"
        );
        assert_eq!(
            path_string(&store.path_for("chemed123", 11, Some("image/png"))),
            "data/raw/images/chemed123/11.png"
        );
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("lobelia4cosmetics"), "lobelia4cosmetics");
        assert_eq!(sanitize_path_component("../etc"), "___etc");
        assert_eq!(sanitize_path_component("a b"), "a_b");
    }

    #[test]
    fn test_extension_for() {
        assert_eq!(extension_for(Some("image/jpeg")), "jpg");
        assert_eq!(extension_for(Some("image/PNG; charset=binary")), "png");
        assert_eq!(extension_for(Some("application/octet-stream")), "jpg");
        assert_eq!(extension_for(None), "jpg");
    }

    #[tokio::test]
    async fn test_save_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = MediaStore::new(dir.path().join("images"));
        let payload = MediaPayload {
            bytes: vec![0xFF, 0xD8, 0xFF],
            content_type: Some("image/jpeg".to_string()),
        };

        let stored = store.save("tikvahpharma", 77, &payload).await.unwrap();

        assert!(stored.ends_with("images/tikvahpharma/77.jpg"));
        let written = tokio::fs::read(store.path_for("tikvahpharma", 77, Some("image/jpeg")))
            .await
            .unwrap();
        assert_eq!(written, payload.bytes);
        assert!(!store.root().join("tikvahpharma/77.part").exists());
    }
}
