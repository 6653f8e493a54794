//! Manager configuration

use std::path::PathBuf;
use std::time::Duration;

use crate::registry::StreamKey;
use crate::supervisor::{HlsParams, OutputLayout, ReadinessProbe};

/// Environment variable overriding [`ManagerConfig::output_root`]
pub const ENV_OUTPUT_ROOT: &str = "HLS_DIR";
/// Environment variable overriding [`ManagerConfig::url_prefix`]
pub const ENV_URL_PREFIX: &str = "HLS_URL_PREFIX";

/// Stream manager configuration options
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Directory holding one output directory per stream
    pub output_root: PathBuf,

    /// URL prefix under which `output_root` is served
    pub url_prefix: String,

    /// Manifest file name inside each stream directory
    pub manifest_name: String,

    /// Delay between manifest polls during startup
    pub ready_poll_interval: Duration,

    /// Manifest polls before startup is abandoned
    pub ready_attempts: u32,

    /// How long an empty session lingers before it is stopped
    pub release_grace: Duration,

    /// Silence after which a viewer is evicted
    pub viewer_timeout: Duration,

    /// Reaper tick interval
    pub reap_interval: Duration,

    /// How long a transcoder gets to quit before it is killed
    pub terminate_grace: Duration,

    /// HLS segment duration
    pub segment_duration: Duration,

    /// Segments kept in the manifest
    pub playlist_size: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            output_root: PathBuf::from("hls"),
            url_prefix: "/hls".into(),
            manifest_name: "index.m3u8".into(),
            ready_poll_interval: Duration::from_millis(500),
            ready_attempts: 20, // 10s total
            release_grace: Duration::from_secs(4),
            viewer_timeout: Duration::from_secs(12),
            reap_interval: Duration::from_secs(5),
            terminate_grace: Duration::from_secs(5),
            segment_duration: Duration::from_secs(1),
            playlist_size: 3,
        }
    }
}

impl ManagerConfig {
    /// Create a config writing under `root`
    pub fn with_output_root(root: impl Into<PathBuf>) -> Self {
        Self {
            output_root: root.into(),
            ..Default::default()
        }
    }

    /// Defaults, overridden by `HLS_DIR` and `HLS_URL_PREFIX` when set
    pub fn from_env() -> Self {
        Self::default().apply_env(|name| std::env::var(name).ok())
    }

    fn apply_env(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(root) = var(ENV_OUTPUT_ROOT).filter(|v| !v.trim().is_empty()) {
            self.output_root = PathBuf::from(root);
        }
        if let Some(prefix) = var(ENV_URL_PREFIX).filter(|v| !v.trim().is_empty()) {
            self = self.url_prefix(prefix);
        }
        self
    }

    /// Set the output root directory
    pub fn output_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.output_root = root.into();
        self
    }

    /// Set the playback URL prefix
    pub fn url_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.url_prefix = prefix.trim_end_matches('/').to_owned();
        self
    }

    /// Set the manifest file name
    pub fn manifest_name(mut self, name: impl Into<String>) -> Self {
        self.manifest_name = name.into();
        self
    }

    /// Set the readiness poll interval and attempt count
    pub fn readiness(mut self, interval: Duration, attempts: u32) -> Self {
        self.ready_poll_interval = interval;
        self.ready_attempts = attempts.max(1);
        self
    }

    /// Set the release grace delay
    pub fn release_grace(mut self, grace: Duration) -> Self {
        self.release_grace = grace;
        self
    }

    /// Set the viewer liveness timeout
    pub fn viewer_timeout(mut self, timeout: Duration) -> Self {
        self.viewer_timeout = timeout;
        self
    }

    /// Set the reaper interval
    pub fn reap_interval(mut self, interval: Duration) -> Self {
        self.reap_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Set the graceful stop timeout
    pub fn terminate_grace(mut self, grace: Duration) -> Self {
        self.terminate_grace = grace;
        self
    }

    /// Set the HLS segment duration (whole seconds, at least one)
    pub fn segment_duration(mut self, duration: Duration) -> Self {
        self.segment_duration = duration.max(Duration::from_secs(1));
        self
    }

    /// Set the playlist size
    pub fn playlist_size(mut self, size: u32) -> Self {
        self.playlist_size = size.max(1);
        self
    }

    /// Readiness probe built from these settings
    pub fn probe(&self) -> ReadinessProbe {
        ReadinessProbe::new(self.ready_poll_interval, self.ready_attempts)
    }

    /// HLS muxer parameters built from these settings
    pub fn hls_params(&self) -> HlsParams {
        HlsParams {
            segment_secs: self.segment_duration.as_secs().max(1) as u32,
            list_size: self.playlist_size,
        }
    }

    /// Output directory, manifest path and URL for a stream
    pub fn layout(&self, key: &StreamKey) -> OutputLayout {
        OutputLayout::for_key(&self.output_root, &self.url_prefix, &self.manifest_name, key)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::default();

        assert_eq!(config.output_root, PathBuf::from("hls"));
        assert_eq!(config.url_prefix, "/hls");
        assert_eq!(config.manifest_name, "index.m3u8");
        assert_eq!(config.ready_poll_interval, Duration::from_millis(500));
        assert_eq!(config.ready_attempts, 20);
        assert_eq!(config.release_grace, Duration::from_secs(4));
        assert_eq!(config.viewer_timeout, Duration::from_secs(12));
        assert_eq!(config.reap_interval, Duration::from_secs(5));
        assert_eq!(config.hls_params(), HlsParams::default());
    }

    #[test]
    fn test_with_output_root() {
        let config = ManagerConfig::with_output_root("/var/hls");

        assert_eq!(config.output_root, PathBuf::from("/var/hls"));
        assert_eq!(config.url_prefix, "/hls");
    }

    #[test]
    fn test_builder_url_prefix_trims_slash() {
        let config = ManagerConfig::default().url_prefix("/media/live/");

        assert_eq!(config.url_prefix, "/media/live");
    }

    #[test]
    fn test_builder_readiness() {
        let config = ManagerConfig::default().readiness(Duration::from_millis(100), 0);

        assert_eq!(config.probe().interval, Duration::from_millis(100));
        assert_eq!(config.probe().attempts, 1);
    }

    #[test]
    fn test_builder_timeouts() {
        let config = ManagerConfig::default()
            .release_grace(Duration::from_secs(10))
            .viewer_timeout(Duration::from_secs(30))
            .reap_interval(Duration::ZERO)
            .terminate_grace(Duration::from_secs(2));

        assert_eq!(config.release_grace, Duration::from_secs(10));
        assert_eq!(config.viewer_timeout, Duration::from_secs(30));
        assert_eq!(config.reap_interval, Duration::from_millis(1));
        assert_eq!(config.terminate_grace, Duration::from_secs(2));
    }

    #[test]
    fn test_builder_hls_params() {
        let config = ManagerConfig::default()
            .segment_duration(Duration::from_millis(200))
            .playlist_size(6);

        assert_eq!(
            config.hls_params(),
            HlsParams {
                segment_secs: 1,
                list_size: 6
            }
        );
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> =
            HashMap::from([(ENV_OUTPUT_ROOT, "/srv/hls"), (ENV_URL_PREFIX, "/live/")]);
        let config = ManagerConfig::default().apply_env(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.output_root, PathBuf::from("/srv/hls"));
        assert_eq!(config.url_prefix, "/live");
    }

    #[test]
    fn test_empty_env_ignored() {
        let config = ManagerConfig::default().apply_env(|_| Some("  ".into()));

        assert_eq!(config.output_root, PathBuf::from("hls"));
        assert_eq!(config.url_prefix, "/hls");
    }

    #[test]
    fn test_layout() {
        let config = ManagerConfig::with_output_root("/srv/hls");
        let layout = config.layout(&StreamKey::new(4, 2));

        assert_eq!(layout.dir, PathBuf::from("/srv/hls/device_4/channel_2"));
        assert_eq!(layout.url, "/hls/device_4/channel_2/index.m3u8");
    }
}
