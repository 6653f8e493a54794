//! Shared HLS transcoding sessions for live camera channels
//!
//! `livehub` lets many viewers watch the same camera channel while running a
//! single transcoder per channel. The first viewer starts an ffmpeg process
//! that pulls the channel's RTSP feed and writes a rolling HLS playlist;
//! later viewers get the same playlist URL. The process is stopped a few
//! seconds after the last viewer leaves or goes silent.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use livehub::source::{RtspResolver, StaticDirectory};
//! use livehub::{ManagerConfig, StreamManager, ViewerId};
//!
//! #[tokio::main]
//! async fn main() -> livehub::Result<()> {
//!     let directory = Arc::new(StaticDirectory::new());
//!     let manager = StreamManager::new(
//!         ManagerConfig::from_env(),
//!         directory,
//!         Arc::new(RtspResolver::new()),
//!     );
//!
//!     let viewer = ViewerId::from(42u64);
//!     let playback = manager.acquire(1, 1, viewer.clone()).await?;
//!     println!("play {}", playback.hls_url);
//!
//!     manager.heartbeat(&viewer);
//!     manager.release(1, 1, &viewer);
//!     manager.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! - [`registry`]: stream keys, sessions and the session registry
//! - [`supervisor`]: transcoder launch, readiness probing and shutdown
//! - [`source`]: channel lookup and source locator resolution
//! - [`manager`]: acquire, release, heartbeat and the reaper

pub mod error;
pub mod manager;
pub mod registry;
pub mod source;
pub mod supervisor;

pub use error::{Error, Result};
pub use manager::{AcquireHandle, ManagerConfig, ReapReport, StreamManager};
pub use registry::{SessionState, SessionStats, StreamKey, ViewerId};
pub use supervisor::Playback;
