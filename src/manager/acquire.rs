//! Acquire path and session startup
//!
//! The first caller for a key inserts a Starting placeholder and spawns the
//! startup task; every caller, the first included, then waits on the
//! session's phase. A waiter holds a claim for as long as it waits, and a
//! startup whose claims all go away is cancelled.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::Inner;
use crate::error::{Error, Result};
use crate::registry::entry::Phase;
use crate::registry::store::{Claim, MarkReady};
use crate::registry::{SessionRegistry, StreamKey, ViewerId};
use crate::source::ChannelDescriptor;
use crate::supervisor::{EncodeParams, OutputLayout, PipelineConfig, Playback, ProcessHandle};

/// In-flight acquire
///
/// Resolves to the playback locator. Dropping it before completion cancels
/// the request.
#[derive(Debug)]
pub struct AcquireHandle {
    key: StreamKey,
    task: JoinHandle<Result<Playback>>,
}

impl AcquireHandle {
    pub(super) fn new(key: StreamKey, task: JoinHandle<Result<Playback>>) -> Self {
        Self { key, task }
    }

    /// Stream being acquired
    pub fn key(&self) -> &StreamKey {
        &self.key
    }
}

impl Future for AcquireHandle {
    type Output = Result<Playback>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.task).poll(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => {
                if e.is_panic() {
                    tracing::error!(stream = %self.key, "Acquire task panicked");
                }
                Poll::Ready(Err(Error::Cancelled(self.key.clone())))
            }
        }
    }
}

impl Drop for AcquireHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A caller's stake in a Starting session
///
/// Released on drop unless the caller joined.
struct ClaimGuard<'a> {
    registry: &'a SessionRegistry,
    key: StreamKey,
    id: u64,
    armed: bool,
}

impl<'a> ClaimGuard<'a> {
    fn new(registry: &'a SessionRegistry, key: &StreamKey, id: u64) -> Self {
        Self {
            registry,
            key: key.clone(),
            id,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.release_claim(&self.key, self.id);
        }
    }
}

impl Inner {
    pub(super) async fn acquire(
        self: Arc<Self>,
        device_id: u64,
        channel_id: u64,
        viewer: ViewerId,
    ) -> Result<Playback> {
        if self.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let channel = self.directory.lookup(device_id, channel_id).await?;
        if !channel.connection.active {
            return Err(Error::NotFound(format!(
                "channel {} on device {} is inactive",
                channel_id, device_id
            )));
        }

        let key = StreamKey::new(device_id, channel_id);
        let output = self.config.layout(&key);
        let playback = output.playback();

        loop {
            if self.shutdown.is_cancelled() {
                return Err(Error::ShuttingDown);
            }

            let claim = self
                .registry
                .claim(&key, &viewer, &playback, &self.shutdown, Instant::now());

            match claim {
                Claim::Joined(playback) => return Ok(playback),
                Claim::Created { id, phase, token } => {
                    let guard = ClaimGuard::new(&self.registry, &key, id);
                    let worker = Arc::clone(&self);
                    self.tasks.spawn(worker.start_session(
                        key.clone(),
                        id,
                        channel.clone(),
                        output.clone(),
                        token,
                    ));

                    if let Some(result) = self.await_claim(guard, phase, &viewer).await {
                        return result;
                    }
                }
                Claim::Pending { id, phase } => {
                    let guard = ClaimGuard::new(&self.registry, &key, id);

                    if let Some(result) = self.await_claim(guard, phase, &viewer).await {
                        return result;
                    }
                }
                Claim::Draining(mut phase) => {
                    tracing::debug!(stream = %key, viewer = %viewer, "Waiting for previous session to stop");
                    let stopped = async { phase.wait_for(Phase::is_terminated).await.is_ok() };
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return Err(Error::ShuttingDown),
                        _ = stopped => {}
                    }
                }
            }
        }
    }

    /// Wait for a claimed session to settle
    ///
    /// Returns `None` when the caller should claim again: the session went
    /// away without a startup error to report.
    async fn await_claim(
        &self,
        mut guard: ClaimGuard<'_>,
        mut phase: watch::Receiver<Phase>,
        viewer: &ViewerId,
    ) -> Option<Result<Playback>> {
        let settled = phase
            .wait_for(|p| matches!(p, Phase::Ready | Phase::Terminated(_)))
            .await
            .map(|p| (*p).clone());

        match settled {
            Ok(Phase::Ready) => {
                let playback = self
                    .registry
                    .join(&guard.key, guard.id, viewer, Instant::now())?;
                guard.disarm();
                Some(Ok(playback))
            }
            Ok(Phase::Terminated(Some(err))) => Some(Err(err)),
            _ => None,
        }
    }

    /// Drive a new session from Starting to Ready, or tear it down
    async fn start_session(
        self: Arc<Self>,
        key: StreamKey,
        id: u64,
        channel: ChannelDescriptor,
        output: OutputLayout,
        token: CancellationToken,
    ) {
        let Err(err) = self.run_startup(&key, id, &channel, output, &token).await else {
            return;
        };

        match &err {
            Error::Cancelled(_) | Error::ShuttingDown => {
                tracing::info!(stream = %key, reason = %err, "Session startup abandoned");
            }
            _ => {
                tracing::warn!(stream = %key, error = %err, code = err.code(), "Session startup failed");
            }
        }

        if let Some(teardown) = self.registry.begin_teardown(&key, id) {
            self.complete_teardown(teardown, Some(err)).await;
        }
    }

    async fn run_startup(
        self: &Arc<Self>,
        key: &StreamKey,
        id: u64,
        channel: &ChannelDescriptor,
        output: OutputLayout,
        token: &CancellationToken,
    ) -> Result<()> {
        let source = tokio::select! {
            _ = token.cancelled() => return Err(self.interrupted(key)),
            source = self.resolver.resolve(channel) => source.map_err(|e| unreachable_upstream(key, e))?,
        };

        let pipeline = PipelineConfig {
            key: key.clone(),
            source,
            output,
            encode: EncodeParams::from_stream(channel.stream.as_ref()),
            hls: self.config.hls_params(),
        };

        let process = self.supervisor.start(&pipeline, token.clone()).await?;

        if !self.registry.attach_process(key, id, Arc::clone(&process)) {
            // Nobody can reach this process through the registry
            if let Err(e) = self
                .supervisor
                .terminate(&process, self.config.terminate_grace)
                .await
            {
                tracing::error!(stream = %key, error = %e, "Failed to stop orphaned transcoder");
            }
            return Err(self.interrupted(key));
        }

        tokio::select! {
            _ = token.cancelled() => return Err(self.interrupted(key)),
            ready = self.supervisor.wait_ready(&pipeline, &process) => ready?,
        }

        match self.registry.mark_ready(key, id, Instant::now()) {
            MarkReady::Ready => {
                self.watch_process(key.clone(), id, process, token.clone());
                Ok(())
            }
            MarkReady::Gone => Err(self.interrupted(key)),
        }
    }

    /// Remove a Ready session if its transcoder exits on its own
    fn watch_process(
        self: &Arc<Self>,
        key: StreamKey,
        id: u64,
        process: Arc<ProcessHandle>,
        token: CancellationToken,
    ) {
        let inner = Arc::clone(self);

        self.tasks.spawn(async move {
            let exit = tokio::select! {
                _ = token.cancelled() => return,
                exit = process.wait() => exit,
            };

            // A deliberate stop moves the session to Terminating first
            let Some(teardown) = inner.registry.begin_teardown(&key, id) else {
                return;
            };

            let err = Error::ProcessCrashed {
                key: key.clone(),
                status: exit.to_string(),
            };
            tracing::warn!(stream = %key, pid = ?process.pid(), error = %err, "Removing crashed session");

            inner.complete_teardown(teardown, Some(err)).await;
        });
    }
}

/// Map a resolver failure to the error reported to viewers
fn unreachable_upstream(key: &StreamKey, err: Error) -> Error {
    match err {
        Error::UpstreamUnreachable { .. } | Error::NotFound(_) => err,
        other => Error::UpstreamUnreachable {
            key: key.clone(),
            reason: other.to_string(),
        },
    }
}
