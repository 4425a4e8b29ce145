//! Tracking for in-flight session tasks
//!
//! The accept loop never waits on sessions. Their join handles are parked here
//! so shutdown can optionally give them a bounded grace period before aborting.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Tracks the join handles of live sessions
pub struct SessionTracker {
    /// Map of session_id -> JoinHandle
    tasks: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl SessionTracker {
    /// Create a new session tracker
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    /// Register a session task
    ///
    /// Must happen before the task can call [`finish`](Self::finish). Handles of
    /// tasks that ended without calling `finish` (a panic) are pruned here.
    pub fn register(&self, session_id: u64, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|_, task| !task.is_finished());
            tasks.insert(session_id, handle);
        }
    }

    /// Forget a session that has ended on its own (does not abort it)
    pub fn finish(&self, session_id: u64) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.remove(&session_id);
        }
    }

    /// Number of sessions still running
    pub fn active(&self) -> usize {
        self.tasks
            .lock()
            .map(|tasks| tasks.len())
            .unwrap_or(0)
    }

    /// Abort every tracked session
    pub fn abort_all(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (_, handle) in tasks.drain() {
                handle.abort();
            }
        }
    }

    /// Wait up to `grace` for tracked sessions to end, then abort the rest
    ///
    /// Returns the number of sessions that had to be aborted.
    pub async fn drain(&self, grace: Duration) -> usize {
        let handles: Vec<JoinHandle<()>> = match self.tasks.lock() {
            Ok(mut tasks) => tasks.drain().map(|(_, handle)| handle).collect(),
            Err(_) => return 0,
        };

        if handles.is_empty() {
            return 0;
        }

        debug!(sessions = handles.len(), ?grace, "draining sessions");

        let aborts: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_ok()
        {
            return 0;
        }

        let mut aborted = 0;
        for abort in aborts {
            if !abort.is_finished() {
                abort.abort();
                aborted += 1;
            }
        }
        warn!(aborted, "sessions still running after grace period were aborted");
        aborted
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sleeper(secs: u64) -> JoinHandle<()> {
        tokio::spawn(async move { tokio::time::sleep(Duration::from_secs(secs)).await })
    }

    #[tokio::test]
    async fn test_register_and_finish() {
        let tracker = SessionTracker::new();

        tracker.register(1, sleeper(10));
        tracker.register(2, sleeper(10));
        assert_eq!(tracker.active(), 2);

        tracker.finish(1);
        assert_eq!(tracker.active(), 1);

        tracker.abort_all();
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn test_panicked_tasks_are_pruned() {
        let tracker = SessionTracker::new();

        let crashed = tokio::spawn(async { panic!("session crashed") });
        tracker.register(1, crashed);
        tokio::time::timeout(Duration::from_secs(1), async {
            while !tracker.tasks.lock().unwrap()[&1].is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        tracker.register(2, sleeper(10));
        assert_eq!(tracker.active(), 1);
        tracker.abort_all();
    }

    #[tokio::test]
    async fn test_drain_waits_for_short_sessions() {
        let tracker = SessionTracker::new();
        tracker.register(
            1,
            tokio::spawn(async { tokio::time::sleep(Duration::from_millis(20)).await }),
        );

        assert_eq!(tracker.drain(Duration::from_secs(5)).await, 0);
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn test_drain_aborts_stragglers() {
        let tracker = SessionTracker::new();
        let handle = sleeper(60);
        let abort = handle.abort_handle();
        tracker.register(1, handle);

        assert_eq!(tracker.drain(Duration::from_millis(50)).await, 1);

        // Aborting is asynchronous; give the runtime a moment to reap it
        tokio::time::timeout(Duration::from_secs(1), async {
            while !abort.is_finished() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_drain_with_nothing_tracked() {
        let tracker = SessionTracker::default();
        assert_eq!(tracker.drain(Duration::from_millis(1)).await, 0);
    }
}
