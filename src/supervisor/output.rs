//! Per-stream output artifacts
//!
//! Each stream key owns one directory holding the rolling manifest and its
//! trailing segments. The directory is wiped before every new session so a
//! viewer can never be handed segments written by a dead transcoder.

use std::io;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::registry::StreamKey;

/// Playback locator handed back to the serving layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Playback {
    /// URL of the HLS manifest, relative to the static file server
    pub hls_url: String,
}

/// Where a stream's transcoder writes and where players read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    /// Directory holding the manifest and segments
    pub dir: PathBuf,
    /// Manifest file path
    pub manifest: PathBuf,
    /// Manifest URL
    pub url: String,
}

impl OutputLayout {
    /// Compute the layout for a stream key
    pub fn for_key(root: &Path, url_prefix: &str, manifest_name: &str, key: &StreamKey) -> Self {
        let segment = key.path_segment();
        let dir = root
            .join(format!("device_{}", key.device_id))
            .join(format!("channel_{}", key.channel_id));
        let manifest = dir.join(manifest_name);
        let url = format!(
            "{}/{}/{}",
            url_prefix.trim_end_matches('/'),
            segment,
            manifest_name
        );

        Self { dir, manifest, url }
    }

    /// Playback locator for this layout
    pub fn playback(&self) -> Playback {
        Playback {
            hls_url: self.url.clone(),
        }
    }

    /// Purge leftovers from a previous session and recreate the directory
    pub async fn prepare(&self) -> io::Result<()> {
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {
                tracing::debug!(dir = %self.dir.display(), "Purged stale output");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        tokio::fs::create_dir_all(&self.dir).await
    }
}
