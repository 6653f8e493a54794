//! Stream and viewer identities
//!
//! A [`StreamKey`] names one physical channel. It is built from the device
//! and channel ids alone, so refreshed credentials or a re-resolved RTSP port
//! never split one camera into two sessions, and two cameras that happen to
//! resolve to the same address never share one.

use std::fmt;

/// Unique identifier for a live channel (device id + channel id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamKey {
    /// Device id in the directory
    pub device_id: u64,
    /// Channel id in the directory
    pub channel_id: u64,
}

impl StreamKey {
    /// Create a new stream key
    pub fn new(device_id: u64, channel_id: u64) -> Self {
        Self {
            device_id,
            channel_id,
        }
    }

    /// Relative path used for the output directory and playback URL
    pub fn path_segment(&self) -> String {
        format!("device_{}/channel_{}", self.device_id, self.channel_id)
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "device_{}/channel_{}", self.device_id, self.channel_id)
    }
}

/// Identity of a viewer (the requesting user)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewerId(String);

impl ViewerId {
    /// Create a viewer id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the raw id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ViewerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ViewerId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for ViewerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for ViewerId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}
