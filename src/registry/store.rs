//! Session registry implementation
//!
//! The central map from stream key to session. Every mutation goes through
//! one mutex, which is never held across an `.await`; that is what makes
//! "one session per key" and "the viewer index matches the sessions" hold
//! under any interleaving of acquires, releases, heartbeats and reaper
//! passes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::entry::{PendingTermination, Phase, SessionEntry, SessionState, SessionStats, Teardown};
use super::key::{StreamKey, ViewerId};
use crate::error::Error;
use crate::supervisor::{Playback, ProcessHandle};

/// Outcome of [`SessionRegistry::claim`]
pub(crate) enum Claim {
    /// Session was ready; the viewer is attached
    Joined(Playback),
    /// Session is starting; wait for it, then [`join`](SessionRegistry::join)
    Pending {
        id: u64,
        phase: watch::Receiver<Phase>,
    },
    /// A new session was inserted; the caller must start it
    Created {
        id: u64,
        phase: watch::Receiver<Phase>,
        token: CancellationToken,
    },
    /// The previous session is still shutting down; wait and retry
    Draining(watch::Receiver<Phase>),
}

/// Outcome of [`SessionRegistry::remove_viewer`]
#[derive(Debug)]
pub(crate) enum Removal {
    /// The viewer was not attached to that stream
    NotAttached,
    /// Viewers left after removal
    Remaining(usize),
    /// Last viewer left; a delayed termination has been armed
    Idle { id: u64, timer: PendingTermination },
}

/// Outcome of [`SessionRegistry::mark_ready`]
#[derive(Debug)]
pub(crate) enum MarkReady {
    /// Ready; waiting callers may join
    Ready,
    /// The session was torn down meanwhile
    Gone,
}

/// Result of one reaper sweep
#[derive(Debug, Default)]
pub(crate) struct Sweep {
    pub(crate) evicted: Vec<(StreamKey, ViewerId)>,
    pub(crate) teardowns: Vec<Teardown>,
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<StreamKey, SessionEntry>,
    /// Secondary index: viewer -> streams it is attached to
    viewers: HashMap<ViewerId, HashSet<StreamKey>>,
}

/// Central registry for all active sessions
pub struct SessionRegistry {
    state: Mutex<RegistryState>,
    next_id: AtomicU64,
    next_seq: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            next_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(1),
        }
    }

    /// Get or create the session for a key
    ///
    /// Exactly one caller receives [`Claim::Created`] for a given session, no
    /// matter how many race on a new key.
    pub(crate) fn claim(
        &self,
        key: &StreamKey,
        viewer: &ViewerId,
        playback: &Playback,
        parent: &CancellationToken,
        now: Instant,
    ) -> Claim {
        let mut state = self.state.lock();
        let RegistryState { sessions, viewers } = &mut *state;

        if let Some(entry) = sessions.get_mut(key) {
            return match entry.state() {
                SessionState::Ready => {
                    entry.viewers.insert(viewer.clone(), now);
                    index(viewers, viewer, key);
                    if entry.cancel_pending() {
                        tracing::debug!(stream = %key, viewer = %viewer, "Pending termination cancelled");
                    }
                    tracing::info!(
                        stream = %key,
                        viewer = %viewer,
                        viewers = entry.refcount(),
                        "Viewer joined existing session"
                    );
                    Claim::Joined(entry.playback.clone())
                }
                SessionState::Starting => {
                    entry.claims += 1;
                    tracing::debug!(
                        stream = %key,
                        viewer = %viewer,
                        claims = entry.claims,
                        "Waiting for session startup"
                    );
                    Claim::Pending {
                        id: entry.id,
                        phase: entry.subscribe(),
                    }
                }
                SessionState::Terminating | SessionState::Terminated => {
                    Claim::Draining(entry.subscribe())
                }
            };
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = parent.child_token();
        let entry = SessionEntry::new(id, key.clone(), playback.clone(), token.clone(), now);
        let phase = entry.subscribe();
        sessions.insert(key.clone(), entry);

        tracing::info!(stream = %key, viewer = %viewer, session = id, "Session created");

        Claim::Created { id, phase, token }
    }

    /// Attach a viewer whose claim on a starting session has resolved
    ///
    /// Returns `None` if the session is gone or not ready.
    pub(crate) fn join(
        &self,
        key: &StreamKey,
        id: u64,
        viewer: &ViewerId,
        now: Instant,
    ) -> Option<Playback> {
        let mut state = self.state.lock();
        let RegistryState { sessions, viewers } = &mut *state;

        let entry = sessions.get_mut(key).filter(|e| e.id == id)?;
        if entry.state() != SessionState::Ready {
            return None;
        }

        entry.claims = entry.claims.saturating_sub(1);
        entry.viewers.insert(viewer.clone(), now);
        index(viewers, viewer, key);
        entry.cancel_pending();

        tracing::info!(
            stream = %key,
            viewer = %viewer,
            viewers = entry.refcount(),
            "Viewer joined new session"
        );

        Some(entry.playback.clone())
    }

    /// Drop a claim that will not be turned into a viewer
    ///
    /// A starting session left without claims has its startup cancelled.
    pub(crate) fn release_claim(&self, key: &StreamKey, id: u64) {
        let mut state = self.state.lock();

        let Some(entry) = state.sessions.get_mut(key).filter(|e| e.id == id) else {
            return;
        };

        entry.claims = entry.claims.saturating_sub(1);
        if entry.state() == SessionState::Starting && entry.claims == 0 {
            tracing::info!(stream = %key, session = id, "All callers gone, cancelling startup");
            entry.token.cancel();
        }
    }

    /// Record the spawned process of a starting session
    pub(crate) fn attach_process(
        &self,
        key: &StreamKey,
        id: u64,
        process: Arc<ProcessHandle>,
    ) -> bool {
        let mut state = self.state.lock();

        match state.sessions.get_mut(key).filter(|e| e.id == id) {
            Some(entry) if entry.state() == SessionState::Starting => {
                entry.process = Some(process);
                true
            }
            _ => false,
        }
    }

    /// Move a starting session to Ready
    pub(crate) fn mark_ready(&self, key: &StreamKey, id: u64, now: Instant) -> MarkReady {
        let mut state = self.state.lock();

        let Some(entry) = state.sessions.get_mut(key).filter(|e| e.id == id) else {
            return MarkReady::Gone;
        };
        // Startup was cancelled after the probe succeeded
        if entry.state() != SessionState::Starting || entry.token.is_cancelled() {
            return MarkReady::Gone;
        }

        entry.ready_at = Some(now);
        entry.set_phase(Phase::Ready);

        tracing::info!(
            stream = %key,
            session = id,
            startup_ms = now.saturating_duration_since(entry.created_at).as_millis() as u64,
            waiting = entry.claims,
            "Session ready"
        );

        MarkReady::Ready
    }

    /// Detach a viewer from one stream
    pub(crate) fn remove_viewer(&self, key: &StreamKey, viewer: &ViewerId) -> Removal {
        let mut state = self.state.lock();
        let RegistryState { sessions, viewers } = &mut *state;

        let Some(entry) = sessions.get_mut(key) else {
            return Removal::NotAttached;
        };
        if entry.viewers.remove(viewer).is_none() {
            return Removal::NotAttached;
        }
        unindex(viewers, viewer, key);

        tracing::info!(
            stream = %key,
            viewer = %viewer,
            viewers = entry.refcount(),
            "Viewer left"
        );

        if !entry.viewers.is_empty() {
            return Removal::Remaining(entry.refcount());
        }

        if entry.state() == SessionState::Ready && entry.claims == 0 && entry.pending.is_none() {
            let timer = self.arm_pending(entry);
            return Removal::Idle {
                id: entry.id,
                timer,
            };
        }

        Removal::Remaining(0)
    }

    /// Refresh a viewer's last-seen time on every stream it watches
    pub(crate) fn touch(&self, viewer: &ViewerId, now: Instant) -> usize {
        let mut state = self.state.lock();
        let RegistryState { sessions, viewers } = &mut *state;

        let Some(keys) = viewers.get(viewer) else {
            return 0;
        };

        let mut touched = 0;
        for key in keys {
            if let Some(seen) = sessions
                .get_mut(key)
                .and_then(|e| e.viewers.get_mut(viewer))
            {
                *seen = now;
                touched += 1;
            }
        }
        touched
    }

    /// Refresh a viewer's last-seen time on one stream
    pub(crate) fn touch_stream(&self, key: &StreamKey, viewer: &ViewerId, now: Instant) -> bool {
        let mut state = self.state.lock();

        match state
            .sessions
            .get_mut(key)
            .and_then(|e| e.viewers.get_mut(viewer))
        {
            Some(seen) => {
                *seen = now;
                true
            }
            None => false,
        }
    }

    /// Start tearing down a session, whatever its viewers
    ///
    /// Returns `None` if the session is gone or already terminating.
    pub(crate) fn begin_teardown(&self, key: &StreamKey, id: u64) -> Option<Teardown> {
        let mut state = self.state.lock();

        let entry = state.sessions.get_mut(key).filter(|e| e.id == id)?;
        match entry.state() {
            SessionState::Starting | SessionState::Ready => Some(entry.begin_teardown()),
            SessionState::Terminating | SessionState::Terminated => None,
        }
    }

    /// Tear down a session if the delayed termination armed as `seq` still
    /// stands and nobody came back
    pub(crate) fn begin_idle_teardown(&self, key: &StreamKey, id: u64, seq: u64) -> Option<Teardown> {
        let mut state = self.state.lock();

        let entry = state.sessions.get_mut(key).filter(|e| e.id == id)?;
        let armed = entry.pending.as_ref().is_some_and(|p| p.seq == seq);
        if !armed
            || entry.state() != SessionState::Ready
            || !entry.viewers.is_empty()
            || entry.claims > 0
        {
            return None;
        }

        Some(entry.begin_teardown())
    }

    /// Flag a terminating session whose process could not be stopped
    ///
    /// `outcome` is kept and reported by whichever teardown finally
    /// succeeds.
    pub(crate) fn mark_stalled(&self, key: &StreamKey, id: u64, outcome: Option<Error>) {
        let mut state = self.state.lock();

        if let Some(entry) = state.sessions.get_mut(key).filter(|e| e.id == id) {
            entry.stalled = true;
            if entry.outcome.is_none() {
                entry.outcome = outcome;
            }
        }
    }

    /// Mark a session Terminated and remove it, in one step
    pub(crate) fn finish(&self, key: &StreamKey, id: u64, outcome: Option<Error>) -> bool {
        let mut state = self.state.lock();
        let RegistryState { sessions, viewers } = &mut *state;

        if !sessions.get(key).is_some_and(|e| e.id == id) {
            return false;
        }
        let Some(mut entry) = sessions.remove(key) else {
            return false;
        };

        for viewer in entry.viewers.keys() {
            unindex(viewers, viewer, key);
        }
        entry.cancel_pending();
        entry.token.cancel();

        let outcome = outcome.or_else(|| entry.outcome.take());
        match &outcome {
            Some(err) => tracing::info!(stream = %key, session = id, error = %err, "Session removed"),
            None => tracing::info!(stream = %key, session = id, "Session removed"),
        }
        entry.set_phase(Phase::Terminated(outcome));

        true
    }

    /// Evict silent viewers and collect sessions to stop
    ///
    /// Ready sessions are stopped when eviction empties them, or when they
    /// sit empty with nobody waiting and no delayed termination armed.
    /// Terminating sessions whose last teardown failed are handed out again.
    pub(crate) fn sweep(&self, now: Instant, timeout: Duration) -> Sweep {
        let mut state = self.state.lock();
        let RegistryState { sessions, viewers } = &mut *state;
        let mut sweep = Sweep::default();

        for (key, entry) in sessions.iter_mut() {
            match entry.state() {
                SessionState::Ready => {
                    let stale: Vec<ViewerId> = entry
                        .viewers
                        .iter()
                        .filter(|(_, seen)| now.saturating_duration_since(**seen) > timeout)
                        .map(|(viewer, _)| viewer.clone())
                        .collect();

                    let evicted_any = !stale.is_empty();
                    for viewer in stale {
                        entry.viewers.remove(&viewer);
                        unindex(viewers, &viewer, key);
                        sweep.evicted.push((key.clone(), viewer));
                    }

                    if entry.viewers.is_empty()
                        && entry.claims == 0
                        && (evicted_any || entry.pending.is_none())
                    {
                        sweep.teardowns.push(entry.begin_teardown());
                    }
                }
                SessionState::Terminating if entry.stalled => {
                    entry.stalled = false;
                    sweep.teardowns.push(Teardown {
                        key: key.clone(),
                        id: entry.id,
                        process: entry.process.clone(),
                    });
                }
                _ => {}
            }
        }

        sweep
    }

    /// Move every ready or stalled session to Terminating for shutdown
    ///
    /// Starting sessions are left to their own startup task.
    pub(crate) fn drain(&self) -> Vec<Teardown> {
        let mut state = self.state.lock();

        state
            .sessions
            .values_mut()
            .filter_map(|entry| match entry.state() {
                SessionState::Ready => Some(entry.begin_teardown()),
                SessionState::Terminating if entry.stalled => {
                    entry.stalled = false;
                    Some(Teardown {
                        key: entry.key.clone(),
                        id: entry.id,
                        process: entry.process.clone(),
                    })
                }
                _ => None,
            })
            .collect()
    }

    fn arm_pending(&self, entry: &mut SessionEntry) -> PendingTermination {
        let pending = PendingTermination {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            token: entry.token.child_token(),
        };
        entry.pending = Some(pending.clone());
        pending
    }

    /// Statistics for one stream
    pub fn stats(&self, key: &StreamKey) -> Option<SessionStats> {
        let state = self.state.lock();
        state.sessions.get(key).map(|e| e.stats(Instant::now()))
    }

    /// Statistics for every stream
    pub fn all_stats(&self) -> Vec<SessionStats> {
        let state = self.state.lock();
        let now = Instant::now();
        let mut all: Vec<SessionStats> = state.sessions.values().map(|e| e.stats(now)).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    /// State of a stream's session
    pub fn state_of(&self, key: &StreamKey) -> Option<SessionState> {
        self.state.lock().sessions.get(key).map(SessionEntry::state)
    }

    /// Viewers attached to a stream, sorted
    pub fn viewers_of(&self, key: &StreamKey) -> Vec<ViewerId> {
        let state = self.state.lock();
        let mut viewers: Vec<ViewerId> = state
            .sessions
            .get(key)
            .map(|e| e.viewers.keys().cloned().collect())
            .unwrap_or_default();
        viewers.sort();
        viewers
    }

    /// Streams a viewer is attached to, sorted
    pub fn keys_for(&self, viewer: &ViewerId) -> Vec<StreamKey> {
        let state = self.state.lock();
        let mut keys: Vec<StreamKey> = state
            .viewers
            .get(viewer)
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Whether a session exists for the key
    pub fn contains(&self, key: &StreamKey) -> bool {
        self.state.lock().sessions.contains_key(key)
    }

    /// Number of sessions
    pub fn len(&self) -> usize {
        self.state.lock().sessions.len()
    }

    /// Whether the registry holds no sessions
    pub fn is_empty(&self) -> bool {
        self.state.lock().sessions.is_empty()
    }

    /// Check that the viewer index and the sessions agree and that no
    /// terminated session is still registered
    pub fn is_consistent(&self) -> bool {
        let state = self.state.lock();

        let sessions_ok = state.sessions.iter().all(|(key, entry)| {
            entry.key == *key
                && entry.state() != SessionState::Terminated
                && entry.viewers.keys().all(|viewer| {
                    state
                        .viewers
                        .get(viewer)
                        .is_some_and(|keys| keys.contains(key))
                })
        });

        let index_ok = state.viewers.iter().all(|(viewer, keys)| {
            !keys.is_empty()
                && keys.iter().all(|key| {
                    state
                        .sessions
                        .get(key)
                        .is_some_and(|e| e.viewers.contains_key(viewer))
                })
        });

        sessions_ok && index_ok
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn index(viewers: &mut HashMap<ViewerId, HashSet<StreamKey>>, viewer: &ViewerId, key: &StreamKey) {
    viewers
        .entry(viewer.clone())
        .or_default()
        .insert(key.clone());
}

fn unindex(viewers: &mut HashMap<ViewerId, HashSet<StreamKey>>, viewer: &ViewerId, key: &StreamKey) {
    if let Some(keys) = viewers.get_mut(viewer) {
        keys.remove(key);
        if keys.is_empty() {
            viewers.remove(viewer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn playback(key: &StreamKey) -> Playback {
        Playback {
            hls_url: format!("/hls/{}/index.m3u8", key.path_segment()),
        }
    }

    /// Create a session and bring it to Ready with the creator attached
    fn ready_session(registry: &SessionRegistry, key: &StreamKey, viewer: &ViewerId) -> u64 {
        let root = CancellationToken::new();
        let now = Instant::now();
        let Claim::Created { id, .. } = registry.claim(key, viewer, &playback(key), &root, now) else {
            panic!("expected a new session");
        };
        assert!(matches!(
            registry.mark_ready(key, id, now),
            MarkReady::Ready
        ));
        registry.join(key, id, viewer, now).unwrap();
        id
    }

    #[tokio::test]
    async fn test_claim_creates_once() {
        let registry = SessionRegistry::new();
        let root = CancellationToken::new();
        let key = StreamKey::new(1, 1);
        let now = Instant::now();

        let first = registry.claim(&key, &"a".into(), &playback(&key), &root, now);
        let second = registry.claim(&key, &"b".into(), &playback(&key), &root, now);

        assert!(matches!(first, Claim::Created { .. }));
        assert!(matches!(second, Claim::Pending { .. }));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.state_of(&key), Some(SessionState::Starting));
        assert_eq!(registry.stats(&key).unwrap().pending_claims, 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_claims_create_one_session() {
        let registry = Arc::new(SessionRegistry::new());
        let root = CancellationToken::new();
        let key = StreamKey::new(9, 9);

        let handles: Vec<_> = (0..32)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let root = root.clone();
                let key = key.clone();
                tokio::spawn(async move {
                    let viewer = ViewerId::from(i as u64);
                    matches!(
                        registry.claim(&key, &viewer, &playback(&key), &root, Instant::now()),
                        Claim::Created { .. }
                    )
                })
            })
            .collect();

        let mut created = 0;
        for handle in handles {
            if handle.await.unwrap() {
                created += 1;
            }
        }

        assert_eq!(created, 1);
        assert_eq!(registry.stats(&key).unwrap().pending_claims, 32);
    }

    #[tokio::test]
    async fn test_pending_claims_join_on_ready() {
        let registry = SessionRegistry::new();
        let root = CancellationToken::new();
        let key = StreamKey::new(1, 2);
        let now = Instant::now();

        let Claim::Created { id, mut phase, .. } =
            registry.claim(&key, &"a".into(), &playback(&key), &root, now)
        else {
            panic!("expected a new session");
        };
        let Claim::Pending { id: same, .. } =
            registry.claim(&key, &"b".into(), &playback(&key), &root, now)
        else {
            panic!("expected to wait");
        };
        assert_eq!(id, same);

        // Not joinable while starting
        assert!(registry.join(&key, id, &"a".into(), now).is_none());

        registry.mark_ready(&key, id, now);
        assert!(matches!(*phase.borrow_and_update(), Phase::Ready));

        registry.join(&key, id, &"a".into(), now).unwrap();
        registry.join(&key, id, &"b".into(), now).unwrap();

        let stats = registry.stats(&key).unwrap();
        assert_eq!(stats.viewer_count, 2);
        assert_eq!(stats.pending_claims, 0);
        assert_eq!(registry.viewers_of(&key), vec![ViewerId::from("a"), ViewerId::from("b")]);
        assert!(registry.is_consistent());
    }

    #[tokio::test]
    async fn test_ready_claim_joins_directly() {
        let registry = SessionRegistry::new();
        let key = StreamKey::new(1, 1);
        ready_session(&registry, &key, &"a".into());

        let claim = registry.claim(
            &key,
            &"b".into(),
            &playback(&key),
            &CancellationToken::new(),
            Instant::now(),
        );

        assert!(matches!(claim, Claim::Joined(_)));
        assert_eq!(registry.stats(&key).unwrap().viewer_count, 2);

        // Same viewer again does not double count
        registry.claim(
            &key,
            &"b".into(),
            &playback(&key),
            &CancellationToken::new(),
            Instant::now(),
        );
        assert_eq!(registry.stats(&key).unwrap().viewer_count, 2);
    }

    #[tokio::test]
    async fn test_last_viewer_arms_timer_and_rejoin_cancels_it() {
        let registry = SessionRegistry::new();
        let key = StreamKey::new(1, 1);
        let viewer = ViewerId::from("a");
        let id = ready_session(&registry, &key, &viewer);

        let Removal::Idle { id: idle_id, timer } = registry.remove_viewer(&key, &viewer) else {
            panic!("expected the session to go idle");
        };
        assert_eq!(idle_id, id);
        assert!(registry.stats(&key).unwrap().termination_pending);

        // Reconnect before the grace delay
        registry.claim(
            &key,
            &viewer,
            &playback(&key),
            &CancellationToken::new(),
            Instant::now(),
        );

        assert!(timer.token.is_cancelled());
        assert!(registry.begin_idle_teardown(&key, id, timer.seq).is_none());
        assert_eq!(registry.state_of(&key), Some(SessionState::Ready));
    }

    #[tokio::test]
    async fn test_stale_timer_cannot_tear_down_rearmed_session() {
        let registry = SessionRegistry::new();
        let key = StreamKey::new(1, 1);
        let viewer = ViewerId::from("a");
        let id = ready_session(&registry, &key, &viewer);

        let Removal::Idle { timer: first, .. } = registry.remove_viewer(&key, &viewer) else {
            panic!("expected idle");
        };
        registry.claim(&key, &viewer, &playback(&key), &CancellationToken::new(), Instant::now());
        let Removal::Idle { timer: second, .. } = registry.remove_viewer(&key, &viewer) else {
            panic!("expected idle");
        };

        assert!(registry.begin_idle_teardown(&key, id, first.seq).is_none());
        assert!(registry.begin_idle_teardown(&key, id, second.seq).is_some());
        assert_eq!(registry.state_of(&key), Some(SessionState::Terminating));
    }

    #[tokio::test]
    async fn test_remove_unknown_viewer() {
        let registry = SessionRegistry::new();
        let key = StreamKey::new(1, 1);
        ready_session(&registry, &key, &"a".into());

        assert!(matches!(
            registry.remove_viewer(&key, &"nobody".into()),
            Removal::NotAttached
        ));
        assert!(matches!(
            registry.remove_viewer(&StreamKey::new(5, 5), &"a".into()),
            Removal::NotAttached
        ));
    }

    #[tokio::test]
    async fn test_terminating_key_is_draining() {
        let registry = SessionRegistry::new();
        let key = StreamKey::new(1, 1);
        let id = ready_session(&registry, &key, &"a".into());

        registry.begin_teardown(&key, id).unwrap();
        // A second teardown is refused
        assert!(registry.begin_teardown(&key, id).is_none());

        let claim = registry.claim(
            &key,
            &"b".into(),
            &playback(&key),
            &CancellationToken::new(),
            Instant::now(),
        );
        let Claim::Draining(mut phase) = claim else {
            panic!("expected to wait for teardown");
        };

        assert!(registry.finish(&key, id, None));
        assert!(phase.borrow_and_update().is_terminated());
        assert!(!registry.contains(&key));
        assert!(registry.keys_for(&"a".into()).is_empty());
        assert!(registry.is_consistent());
    }

    #[tokio::test]
    async fn test_finish_ignores_other_generation() {
        let registry = SessionRegistry::new();
        let key = StreamKey::new(1, 1);
        let id = ready_session(&registry, &key, &"a".into());

        assert!(!registry.finish(&key, id + 100, None));
        assert!(registry.contains(&key));
    }

    #[tokio::test]
    async fn test_release_last_claim_cancels_startup() {
        let registry = SessionRegistry::new();
        let root = CancellationToken::new();
        let key = StreamKey::new(1, 1);

        let Claim::Created { id, token, .. } =
            registry.claim(&key, &"a".into(), &playback(&key), &root, Instant::now())
        else {
            panic!("expected a new session");
        };
        registry.claim(&key, &"b".into(), &playback(&key), &root, Instant::now());

        registry.release_claim(&key, id);
        assert!(!token.is_cancelled());

        registry.release_claim(&key, id);
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_startup_without_claims_cannot_become_ready() {
        let registry = SessionRegistry::new();
        let root = CancellationToken::new();
        let key = StreamKey::new(1, 1);

        let Claim::Created { id, .. } =
            registry.claim(&key, &"a".into(), &playback(&key), &root, Instant::now())
        else {
            panic!("expected a new session");
        };
        registry.release_claim(&key, id);

        assert!(matches!(
            registry.mark_ready(&key, id, Instant::now()),
            MarkReady::Gone
        ));
        assert_eq!(registry.stats(&key).unwrap().pending_claims, 0);
    }

    #[tokio::test]
    async fn test_cancelled_startup_cannot_become_ready() {
        let registry = SessionRegistry::new();
        let root = CancellationToken::new();
        let key = StreamKey::new(1, 1);

        let Claim::Created { id, .. } =
            registry.claim(&key, &"a".into(), &playback(&key), &root, Instant::now())
        else {
            panic!("expected a new session");
        };
        root.cancel();

        assert!(matches!(
            registry.mark_ready(&key, id, Instant::now()),
            MarkReady::Gone
        ));
        assert_eq!(registry.state_of(&key), Some(SessionState::Starting));
    }

    #[tokio::test]
    async fn test_touch_uses_index() {
        let registry = SessionRegistry::new();
        let viewer = ViewerId::from("a");
        let k1 = StreamKey::new(1, 1);
        let k2 = StreamKey::new(1, 2);
        ready_session(&registry, &k1, &viewer);
        ready_session(&registry, &k2, &viewer);
        ready_session(&registry, &StreamKey::new(2, 1), &"other".into());

        assert_eq!(registry.touch(&viewer, Instant::now()), 2);
        assert_eq!(registry.touch(&"ghost".into(), Instant::now()), 0);
        assert!(registry.touch_stream(&k1, &viewer, Instant::now()));
        assert!(!registry.touch_stream(&k1, &"other".into(), Instant::now()));
        assert_eq!(registry.keys_for(&viewer), vec![k1, k2]);
    }

    #[tokio::test]
    async fn test_sweep_evicts_silent_viewers() {
        let registry = SessionRegistry::new();
        let key = StreamKey::new(1, 1);
        let timeout = Duration::from_secs(12);
        let id = ready_session(&registry, &key, &"quiet".into());
        registry.claim(
            &key,
            &"chatty".into(),
            &playback(&key),
            &CancellationToken::new(),
            Instant::now(),
        );

        let later = Instant::now() + Duration::from_secs(13);
        registry.touch(&"chatty".into(), later);

        let sweep = registry.sweep(later, timeout);
        assert_eq!(sweep.evicted, vec![(key.clone(), ViewerId::from("quiet"))]);
        assert!(sweep.teardowns.is_empty());
        assert_eq!(registry.stats(&key).unwrap().viewer_count, 1);

        // Now the remaining viewer goes silent too
        let much_later = later + Duration::from_secs(13);
        let sweep = registry.sweep(much_later, timeout);
        assert_eq!(sweep.evicted.len(), 1);
        assert_eq!(sweep.teardowns.len(), 1);
        assert_eq!(sweep.teardowns[0].id, id);
        assert_eq!(registry.state_of(&key), Some(SessionState::Terminating));
        assert!(registry.is_consistent());
    }

    #[tokio::test]
    async fn test_sweep_leaves_grace_period_alone() {
        let registry = SessionRegistry::new();
        let key = StreamKey::new(1, 1);
        let viewer = ViewerId::from("a");
        ready_session(&registry, &key, &viewer);
        registry.remove_viewer(&key, &viewer);

        let sweep = registry.sweep(Instant::now(), Duration::from_secs(12));
        assert!(sweep.teardowns.is_empty());
        assert_eq!(registry.state_of(&key), Some(SessionState::Ready));
    }

    #[tokio::test]
    async fn test_sweep_retries_stalled_teardown() {
        let registry = SessionRegistry::new();
        let key = StreamKey::new(1, 1);
        let id = ready_session(&registry, &key, &"a".into());

        registry.begin_teardown(&key, id).unwrap();
        assert!(registry.sweep(Instant::now(), Duration::from_secs(12)).teardowns.is_empty());

        registry.mark_stalled(&key, id, None);
        let sweep = registry.sweep(Instant::now(), Duration::from_secs(12));
        assert_eq!(sweep.teardowns.len(), 1);

        // Handed out once per failure
        assert!(registry.sweep(Instant::now(), Duration::from_secs(12)).teardowns.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_startup_failure_keeps_its_error() {
        let registry = SessionRegistry::new();
        let root = CancellationToken::new();
        let key = StreamKey::new(1, 1);

        let Claim::Created { id, .. } =
            registry.claim(&key, &"a".into(), &playback(&key), &root, Instant::now())
        else {
            panic!("expected a new session");
        };
        let Claim::Pending { mut phase, .. } =
            registry.claim(&key, &"b".into(), &playback(&key), &root, Instant::now())
        else {
            panic!("expected to wait");
        };

        registry.begin_teardown(&key, id).unwrap();
        let failure = Error::ReadinessTimeout {
            key: key.clone(),
            waited: Duration::from_secs(10),
        };
        registry.mark_stalled(&key, id, Some(failure));

        // A later retry knows nothing about the startup
        let sweep = registry.sweep(Instant::now(), Duration::from_secs(12));
        assert_eq!(sweep.teardowns.len(), 1);
        assert!(registry.finish(&key, id, None));

        let Phase::Terminated(Some(err)) = phase.borrow_and_update().clone() else {
            panic!("expected the startup error");
        };
        assert_eq!(err.code(), "READINESS_TIMEOUT");
    }

    #[tokio::test]
    async fn test_drain_skips_starting_sessions() {
        let registry = SessionRegistry::new();
        let root = CancellationToken::new();
        ready_session(&registry, &StreamKey::new(1, 1), &"a".into());
        let starting = StreamKey::new(2, 2);
        registry.claim(&starting, &"b".into(), &playback(&starting), &root, Instant::now());

        let drained = registry.drain();

        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].key, StreamKey::new(1, 1));
        assert_eq!(registry.state_of(&starting), Some(SessionState::Starting));
    }
}
