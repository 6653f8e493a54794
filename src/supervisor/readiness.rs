//! Readiness probe
//!
//! A freshly spawned transcoder needs a few seconds before its manifest lists
//! a segment. Handing the playlist URL out earlier makes players fail, so the
//! first acquire waits for at least one complete segment entry.

use std::path::Path;
use std::time::Duration;

/// Bounded poll of a manifest file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessProbe {
    /// Delay between polls
    pub interval: Duration,
    /// Maximum number of polls
    pub attempts: u32,
}

impl ReadinessProbe {
    pub fn new(interval: Duration, attempts: u32) -> Self {
        Self { interval, attempts }
    }

    /// Upper bound on how long [`wait`](Self::wait) can take
    pub fn budget(&self) -> Duration {
        self.interval * self.attempts
    }

    /// Poll until the manifest is playable
    ///
    /// Returns `false` once every attempt has failed.
    pub async fn wait(&self, manifest: &Path) -> bool {
        for attempt in 1..=self.attempts {
            if is_ready(manifest).await {
                tracing::debug!(
                    manifest = %manifest.display(),
                    attempt = attempt,
                    "Manifest ready"
                );
                return true;
            }
            tokio::time::sleep(self.interval).await;
        }
        false
    }
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), 20)
    }
}

/// Check the manifest once
pub async fn is_ready(manifest: &Path) -> bool {
    match tokio::fs::read_to_string(manifest).await {
        Ok(contents) => has_playable_segment(&contents),
        Err(_) => false,
    }
}

/// Whether a media playlist lists at least one complete segment
///
/// A segment is complete once its `#EXTINF` tag is followed by the segment
/// URI; ffmpeg writes the two together, but a partially flushed manifest can
/// end right after the tag.
pub fn has_playable_segment(manifest: &str) -> bool {
    let mut pending_inf = false;

    for line in manifest.lines().map(str::trim) {
        if line.is_empty() {
            continue;
        }
        if line.starts_with("#EXTINF") {
            pending_inf = true;
        } else if !line.starts_with('#') && pending_inf {
            return true;
        }
    }

    false
}
