//! Shared session orchestration
//!
//! [`StreamManager`] is the entry point for the serving layer. It turns
//! viewer requests into registry operations and drives the transcoders that
//! back them:
//!
//! - **acquire**: look the channel up, then join, wait for, or start the
//!   stream's session
//! - **release**: detach a viewer; the last one out arms a grace timer
//! - **heartbeat**: keep a viewer's attachments alive
//! - **reaper**: evict silent viewers and reclaim abandoned sessions
//!
//! All background work runs on one [`TaskTracker`] under one root
//! [`CancellationToken`], so [`StreamManager::shutdown`] can stop it all and
//! wait for every transcoder to exit.

pub mod acquire;
pub mod config;
pub mod reaper;

use std::sync::Arc;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};
use crate::registry::entry::{PendingTermination, Teardown};
use crate::registry::store::Removal;
use crate::registry::{SessionRegistry, SessionStats, StreamKey, ViewerId};
use crate::source::{ChannelDirectory, SourceResolver};
use crate::supervisor::{FfmpegLauncher, Launcher, Playback, Supervisor};

pub use acquire::AcquireHandle;
pub use config::ManagerConfig;
pub use reaper::ReapReport;

/// Handle to the stream manager
///
/// Cheap to clone; every clone drives the same registry.
#[derive(Clone)]
pub struct StreamManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ManagerConfig,
    registry: Arc<SessionRegistry>,
    supervisor: Supervisor,
    directory: Arc<dyn ChannelDirectory>,
    resolver: Arc<dyn SourceResolver>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl StreamManager {
    /// Create a manager launching ffmpeg from `PATH`
    ///
    /// Must be called from within a Tokio runtime; the reaper starts
    /// immediately.
    pub fn new(
        config: ManagerConfig,
        directory: Arc<dyn ChannelDirectory>,
        resolver: Arc<dyn SourceResolver>,
    ) -> Self {
        Self::with_launcher(config, directory, resolver, Arc::new(FfmpegLauncher::new()))
    }

    /// Create a manager with a custom transcoder launcher
    pub fn with_launcher(
        config: ManagerConfig,
        directory: Arc<dyn ChannelDirectory>,
        resolver: Arc<dyn SourceResolver>,
        launcher: Arc<dyn Launcher>,
    ) -> Self {
        let tasks = TaskTracker::new();
        let supervisor = Supervisor::new(launcher, config.probe(), tasks.clone());

        let inner = Arc::new(Inner {
            config,
            registry: Arc::new(SessionRegistry::new()),
            supervisor,
            directory,
            resolver,
            shutdown: CancellationToken::new(),
            tasks,
        });

        reaper::spawn(&inner);

        tracing::info!(
            output_root = %inner.config.output_root.display(),
            url_prefix = %inner.config.url_prefix,
            "Stream manager started"
        );

        Self { inner }
    }

    /// Start acquiring a stream for a viewer
    ///
    /// The request runs in the background; await the handle for the
    /// playback locator. Dropping the handle cancels the request, and a
    /// session nobody else is waiting for is torn down.
    pub fn begin_acquire(
        &self,
        device_id: u64,
        channel_id: u64,
        viewer: impl Into<ViewerId>,
    ) -> AcquireHandle {
        let key = StreamKey::new(device_id, channel_id);
        let inner = Arc::clone(&self.inner);
        let viewer = viewer.into();
        let task = self
            .inner
            .tasks
            .spawn(async move { inner.acquire(device_id, channel_id, viewer).await });

        AcquireHandle::new(key, task)
    }

    /// Acquire a stream for a viewer and return its playback locator
    ///
    /// Concurrent calls for the same channel share one transcoder.
    pub async fn acquire(
        &self,
        device_id: u64,
        channel_id: u64,
        viewer: impl Into<ViewerId>,
    ) -> Result<Playback> {
        self.begin_acquire(device_id, channel_id, viewer).await
    }

    /// Detach a viewer from a stream
    ///
    /// Returns `false` if the viewer was not attached. When the last viewer
    /// leaves, the session is stopped after the release grace delay unless
    /// someone acquires it again first.
    pub fn release(&self, device_id: u64, channel_id: u64, viewer: &ViewerId) -> bool {
        let key = StreamKey::new(device_id, channel_id);

        match self.inner.registry.remove_viewer(&key, viewer) {
            Removal::NotAttached => {
                tracing::debug!(stream = %key, viewer = %viewer, "Release for unattached viewer");
                false
            }
            Removal::Remaining(_) => true,
            Removal::Idle { id, timer } => {
                self.inner.schedule_idle_teardown(key, id, timer);
                true
            }
        }
    }

    /// Refresh a viewer on every stream it is attached to
    ///
    /// Returns the number of streams refreshed.
    pub fn heartbeat(&self, viewer: &ViewerId) -> usize {
        let touched = self.inner.registry.touch(viewer, Instant::now());
        tracing::trace!(viewer = %viewer, streams = touched, "Heartbeat");
        touched
    }

    /// Refresh a viewer on one stream
    pub fn heartbeat_stream(&self, device_id: u64, channel_id: u64, viewer: &ViewerId) -> bool {
        let key = StreamKey::new(device_id, channel_id);
        self.inner
            .registry
            .touch_stream(&key, viewer, Instant::now())
    }

    /// Run one reaper pass now and wait for its teardowns
    pub async fn reap_now(&self) -> ReapReport {
        self.inner.reap_once(Instant::now()).await
    }

    /// Statistics for one stream
    pub fn stats(&self, device_id: u64, channel_id: u64) -> Option<SessionStats> {
        self.inner
            .registry
            .stats(&StreamKey::new(device_id, channel_id))
    }

    /// Statistics for every stream
    pub fn all_stats(&self) -> Vec<SessionStats> {
        self.inner.registry.all_stats()
    }

    /// Number of sessions
    pub fn session_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// The underlying registry
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.inner.registry
    }

    /// Active configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Stop the reaper, cancel pending work and stop every transcoder
    ///
    /// Returns once all background tasks have finished. Acquires made after
    /// this fail with [`Error::ShuttingDown`].
    pub async fn shutdown(&self) {
        let inner = &self.inner;

        tracing::info!(sessions = inner.registry.len(), "Shutting down stream manager");
        inner.shutdown.cancel();

        for teardown in inner.registry.drain() {
            let worker = Arc::clone(inner);
            inner.tasks.spawn(async move {
                worker
                    .complete_teardown(teardown, Some(Error::ShuttingDown))
                    .await;
            });
        }

        inner.tasks.close();
        inner.tasks.wait().await;

        let remaining = inner.registry.len();
        if remaining > 0 {
            tracing::error!(remaining = remaining, "Sessions left after shutdown");
        } else {
            tracing::info!("Stream manager stopped");
        }
    }
}

impl Inner {
    /// Stop the session once the release grace delay elapses, unless the
    /// timer is disarmed first
    fn schedule_idle_teardown(self: &Arc<Self>, key: StreamKey, id: u64, timer: PendingTermination) {
        let inner = Arc::clone(self);
        let grace = self.config.release_grace;

        tracing::debug!(stream = %key, grace_ms = grace.as_millis() as u64, "Termination scheduled");

        self.tasks.spawn(async move {
            tokio::select! {
                _ = timer.token.cancelled() => return,
                _ = tokio::time::sleep(grace) => {}
            }

            if let Some(teardown) = inner.registry.begin_idle_teardown(&key, id, timer.seq) {
                tracing::info!(stream = %key, "No viewers left, stopping session");
                inner.complete_teardown(teardown, None).await;
            }
        });
    }

    /// Stop a Terminating session's process and remove the session
    ///
    /// Returns `false` if the process could not be stopped; the session is
    /// then flagged for the reaper to retry, keeping `outcome` for waiters.
    async fn complete_teardown(&self, teardown: Teardown, outcome: Option<Error>) -> bool {
        if let Some(process) = &teardown.process {
            if let Err(e) = self
                .supervisor
                .terminate(process, self.config.terminate_grace)
                .await
            {
                tracing::error!(
                    stream = %teardown.key,
                    pid = ?process.pid(),
                    error = %e,
                    "Failed to stop transcoder"
                );
                self.registry
                    .mark_stalled(&teardown.key, teardown.id, outcome);
                return false;
            }
        }

        self.registry.finish(&teardown.key, teardown.id, outcome)
    }

    /// Error for a startup or wait that was interrupted
    fn interrupted(&self, key: &StreamKey) -> Error {
        if self.shutdown.is_cancelled() {
            Error::ShuttingDown
        } else {
            Error::Cancelled(key.clone())
        }
    }
}
