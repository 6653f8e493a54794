//! Collaborator interfaces for channel lookup and source resolution
//!
//! The manager does not talk to a database or to cameras itself. A
//! [`ChannelDirectory`] answers "does this channel exist and how do I reach
//! it", and a [`SourceResolver`] turns that answer into the locator handed to
//! the transcoder, possibly after a round trip to the device.

pub mod rtsp;

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::{Error, Result};

pub use rtsp::RtspResolver;

/// Default frame rate when the channel has no stream configuration
pub const DEFAULT_FRAME_RATE: f64 = 20.0;

/// Login for a device
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"******")
            .finish()
    }
}

/// How to reach a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    /// Host (or host:port of the recorder) serving the stream
    pub address: String,
    /// Device login
    pub credentials: Credentials,
    /// Channel number on the device
    pub channel_no: u32,
    /// RTSP port if already known
    pub rtsp_port: Option<u16>,
    /// Whether the channel is enabled
    pub active: bool,
}

/// Stream configuration reported by the device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamConfig {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub video_codec: Option<String>,
    /// Maximum frame rate in hundredths of a frame per second (2500 = 25 fps)
    pub max_frame_rate: Option<u32>,
}

impl StreamConfig {
    /// Frame rate in frames per second
    pub fn frame_rate(&self) -> f64 {
        match self.max_frame_rate {
            Some(rate) if rate > 0 => rate as f64 / 100.0,
            _ => DEFAULT_FRAME_RATE,
        }
    }

    /// Resolution, if both dimensions are known
    pub fn resolution(&self) -> Option<(u32, u32)> {
        Some((self.width?, self.height?))
    }
}

/// Everything the directory knows about one channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelDescriptor {
    pub device_id: u64,
    pub channel_id: u64,
    pub connection: ConnectionDescriptor,
    pub stream: Option<StreamConfig>,
}

/// Locator of a live source, e.g. an RTSP URL
///
/// The `Display` and `Debug` forms mask the password so locators can be
/// logged freely.
#[derive(Clone, PartialEq, Eq)]
pub struct SourceLocator {
    url: String,
    masked: String,
}

impl SourceLocator {
    /// Create a locator from a full URL and its masked form
    pub fn new(url: impl Into<String>, masked: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            masked: masked.into(),
        }
    }

    /// Create a locator that carries no secrets
    pub fn public(url: impl Into<String>) -> Self {
        let url = url.into();
        Self {
            masked: url.clone(),
            url,
        }
    }

    /// Full URL, including credentials
    pub fn as_str(&self) -> &str {
        &self.url
    }

    /// URL with credentials masked
    pub fn masked(&self) -> &str {
        &self.masked
    }
}

impl fmt::Display for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked)
    }
}

impl fmt::Debug for SourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SourceLocator").field(&self.masked).finish()
    }
}

/// Device/channel lookup
#[async_trait]
pub trait ChannelDirectory: Send + Sync + 'static {
    /// Look up a channel; fails with [`Error::NotFound`] if the device or
    /// channel does not exist
    async fn lookup(&self, device_id: u64, channel_id: u64) -> Result<ChannelDescriptor>;
}

/// Resolution of the final source locator
#[async_trait]
pub trait SourceResolver: Send + Sync + 'static {
    /// Resolve the locator for a channel; transport or auth failures should
    /// be reported as [`Error::UpstreamUnreachable`]
    async fn resolve(&self, channel: &ChannelDescriptor) -> Result<SourceLocator>;
}

/// In-memory channel directory
#[derive(Debug, Default)]
pub struct StaticDirectory {
    channels: RwLock<HashMap<(u64, u64), ChannelDescriptor>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a channel
    pub fn insert(&self, channel: ChannelDescriptor) {
        self.channels
            .write()
            .insert((channel.device_id, channel.channel_id), channel);
    }

    /// Remove a channel
    pub fn remove(&self, device_id: u64, channel_id: u64) -> Option<ChannelDescriptor> {
        self.channels.write().remove(&(device_id, channel_id))
    }
}

#[async_trait]
impl ChannelDirectory for StaticDirectory {
    async fn lookup(&self, device_id: u64, channel_id: u64) -> Result<ChannelDescriptor> {
        self.channels
            .read()
            .get(&(device_id, channel_id))
            .cloned()
            .ok_or_else(|| {
                Error::NotFound(format!("channel {} on device {}", channel_id, device_id))
            })
    }
}
