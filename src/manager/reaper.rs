//! Periodic eviction of silent viewers
//!
//! Viewers that stop sending heartbeats (closed tab, lost network) never call
//! release. The reaper evicts them once they have been silent for longer than
//! the viewer timeout and stops sessions that nobody holds any more.

use std::sync::{Arc, Weak};

use tokio::time::{Instant, MissedTickBehavior};

use super::Inner;

/// Outcome of one reaper pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Viewers evicted for silence
    pub evicted: usize,
    /// Sessions stopped and removed
    pub terminated: usize,
    /// Sessions whose transcoder could not be stopped
    pub failed: usize,
}

impl ReapReport {
    /// Whether the pass changed nothing
    pub fn is_empty(&self) -> bool {
        self.evicted == 0 && self.terminated == 0 && self.failed == 0
    }
}

/// Spawn the reaper loop
///
/// The loop holds only a weak reference to the manager and stops on
/// shutdown or once the manager is dropped.
pub(super) fn spawn(inner: &Arc<Inner>) {
    let weak: Weak<Inner> = Arc::downgrade(inner);
    let shutdown = inner.shutdown.clone();
    let interval = inner.config.reap_interval;

    inner.tasks.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let Some(inner) = weak.upgrade() else {
                break;
            };

            let report = inner.reap_once(Instant::now()).await;
            if !report.is_empty() {
                tracing::info!(
                    evicted = report.evicted,
                    terminated = report.terminated,
                    failed = report.failed,
                    "Reaper pass"
                );
            }
        }

        tracing::debug!("Reaper stopped");
    });
}

impl Inner {
    /// Evict, then stop every session the sweep handed out
    ///
    /// Teardowns run as tracked tasks so shutdown waits for them even if
    /// this pass is dropped.
    pub(super) async fn reap_once(self: &Arc<Self>, now: Instant) -> ReapReport {
        let sweep = self.registry.sweep(now, self.config.viewer_timeout);

        for (key, viewer) in &sweep.evicted {
            tracing::info!(stream = %key, viewer = %viewer, "Evicted silent viewer");
        }

        let mut report = ReapReport {
            evicted: sweep.evicted.len(),
            ..Default::default()
        };

        let handles: Vec<_> = sweep
            .teardowns
            .into_iter()
            .map(|teardown| {
                tracing::info!(stream = %teardown.key, "Stopping abandoned session");
                let inner = Arc::clone(self);
                self.tasks
                    .spawn(async move { inner.complete_teardown(teardown, None).await })
            })
            .collect();

        for handle in handles {
            match handle.await {
                Ok(true) => report.terminated += 1,
                Ok(false) => report.failed += 1,
                Err(e) => {
                    tracing::error!(error = %e, "Teardown task failed");
                    report.failed += 1;
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_report() {
        assert!(ReapReport::default().is_empty());
        assert!(!ReapReport {
            evicted: 1,
            ..Default::default()
        }
        .is_empty());
    }
}
