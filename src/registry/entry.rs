//! Session entry and state types
//!
//! This module defines the per-stream state stored in the registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::key::{StreamKey, ViewerId};
use crate::error::Error;
use crate::supervisor::{Playback, ProcessHandle};

/// State of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Transcoder launching, manifest not yet playable
    Starting,
    /// Manifest playable, viewers may attach
    Ready,
    /// Transcoder being stopped; the key stays reserved until it is gone
    Terminating,
    /// Removed from the registry
    Terminated,
}

/// Lifecycle broadcast to callers waiting on a session
#[derive(Debug, Clone)]
pub(crate) enum Phase {
    Starting,
    Ready,
    Terminating,
    /// Final; carries the error that ended startup, if any
    Terminated(Option<Error>),
}

impl Phase {
    pub(crate) fn state(&self) -> SessionState {
        match self {
            Phase::Starting => SessionState::Starting,
            Phase::Ready => SessionState::Ready,
            Phase::Terminating => SessionState::Terminating,
            Phase::Terminated(_) => SessionState::Terminated,
        }
    }

    pub(crate) fn is_terminated(&self) -> bool {
        matches!(self, Phase::Terminated(_))
    }
}

/// Armed delayed-termination timer
#[derive(Debug, Clone)]
pub(crate) struct PendingTermination {
    /// Identifies this arming; a stale timer must not tear down a session
    /// that was re-armed after a reconnect
    pub(crate) seq: u64,
    pub(crate) token: CancellationToken,
}

/// Work order for stopping a session's transcoder
#[derive(Debug)]
pub(crate) struct Teardown {
    pub(crate) key: StreamKey,
    pub(crate) id: u64,
    pub(crate) process: Option<Arc<ProcessHandle>>,
}

/// Entry for a single stream in the registry
///
/// Viewers and their last-seen times live in one map: membership and
/// liveness cannot disagree, and the reference count is its length.
pub(crate) struct SessionEntry {
    /// Generation id, unique across the registry's lifetime
    pub(crate) id: u64,
    pub(crate) key: StreamKey,
    pub(crate) playback: Playback,
    pub(crate) viewers: HashMap<ViewerId, Instant>,
    /// Callers waiting for this session to become ready
    pub(crate) claims: usize,
    pub(crate) process: Option<Arc<ProcessHandle>>,
    pub(crate) pending: Option<PendingTermination>,
    /// A teardown attempt failed; the reaper retries it
    pub(crate) stalled: bool,
    /// Error from a failed teardown attempt, reported on removal
    pub(crate) outcome: Option<Error>,
    /// Cancels startup and every per-session task
    pub(crate) token: CancellationToken,
    phase: watch::Sender<Phase>,
    pub(crate) created_at: Instant,
    pub(crate) ready_at: Option<Instant>,
}

impl SessionEntry {
    /// Create a Starting entry with one claim (the creator's)
    pub(crate) fn new(
        id: u64,
        key: StreamKey,
        playback: Playback,
        token: CancellationToken,
        now: Instant,
    ) -> Self {
        let (phase, _) = watch::channel(Phase::Starting);

        Self {
            id,
            key,
            playback,
            viewers: HashMap::new(),
            claims: 1,
            process: None,
            pending: None,
            stalled: false,
            outcome: None,
            token,
            phase,
            created_at: now,
            ready_at: None,
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        self.phase.borrow().state()
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        self.phase.send_replace(phase);
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Number of attached viewers
    pub(crate) fn refcount(&self) -> usize {
        self.viewers.len()
    }

    /// Disarm the delayed-termination timer, if armed
    pub(crate) fn cancel_pending(&mut self) -> bool {
        match self.pending.take() {
            Some(pending) => {
                pending.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Move to Terminating and hand out the process to stop
    pub(crate) fn begin_teardown(&mut self) -> Teardown {
        self.cancel_pending();
        self.set_phase(Phase::Terminating);

        Teardown {
            key: self.key.clone(),
            id: self.id,
            process: self.process.clone(),
        }
    }

    pub(crate) fn stats(&self, now: Instant) -> SessionStats {
        SessionStats {
            key: self.key.clone(),
            state: self.state(),
            viewer_count: self.refcount(),
            pending_claims: self.claims,
            pid: self.process.as_ref().and_then(|p| p.pid()),
            termination_pending: self.pending.is_some(),
            age: now.saturating_duration_since(self.created_at),
            ready_for: self.ready_at.map(|at| now.saturating_duration_since(at)),
        }
    }
}

/// Snapshot of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionStats {
    pub key: StreamKey,
    pub state: SessionState,
    /// Attached viewers (the reference count)
    pub viewer_count: usize,
    /// Acquires still waiting for readiness
    pub pending_claims: usize,
    /// Transcoder process id
    pub pid: Option<u32>,
    /// Whether a delayed termination is armed
    pub termination_pending: bool,
    /// Time since the session was created
    pub age: Duration,
    /// Time since the session became ready
    pub ready_for: Option<Duration>,
}
