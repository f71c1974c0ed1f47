//! Append-only JSON Lines archive of fetched messages.
//!
//! Layout: `{archive_dir}/{YYYY-MM-DD}/{channel}.jsonl`, dated by the UTC day
//! a message was posted. Lines are appended, so a re-fetched message appears
//! again; the database stays the deduplicated copy.

use crate::media_store::sanitize_path_component;
use medlens_pipeline::{Failure, RawMessage};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::debug;

pub struct RawArchive {
    root: PathBuf,
}

impl RawArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File holding `channel`'s messages posted on `day` (`YYYY-MM-DD`).
    pub fn path_for(&self, channel: &str, day: &str) -> PathBuf {
        self.root
            .join(day)
            .join(format!("{}.jsonl", sanitize_path_component(channel)))
    }

    /// Append `messages` and return how many lines were written.
    pub async fn append(&self, channel: &str, messages: &[RawMessage]) -> Result<usize, Failure> {
        let mut by_day: BTreeMap<String, String> = BTreeMap::new();
        for message in messages {
            let line = serde_json::to_string(message)
                .map_err(|e| Failure::fatal(format!("cannot encode message: {}", e)))?;
            let buf = by_day
                .entry(message.posted_at.format("%Y-%m-%d").to_string())
                .or_default();
            buf.push_str(&line);
            buf.push('\n');
        }

        for (day, lines) in &by_day {
            let path = self.path_for(channel, day);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Failure::fatal(format!("cannot create {}: {}", parent.display(), e)))?;
            }

            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await
                .map_err(|e| Failure::fatal(format!("cannot open {}: {}", path.display(), e)))?;
            file.write_all(lines.as_bytes())
                .await
                .map_err(|e| Failure::fatal(format!("cannot write {}: {}", path.display(), e)))?;
            file.flush()
                .await
                .map_err(|e| Failure::fatal(format!("cannot flush {}: {}", path.display(), e)))?;

            debug!(path = %path.display(), "Messages archived");
        }

        Ok(messages.len())
    }
}
