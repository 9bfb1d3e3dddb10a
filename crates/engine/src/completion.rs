//! Completion tracking for long-running loops.
//!
//! Each loop holds a `CompletionGuard` for its whole lifetime. The guard owns
//! a sender half of a channel nobody ever sends on; once every guard has been
//! dropped the receiver observes the channel closing and `wait` returns. The
//! slot is released exactly once on every exit path, panics included.

use tokio::sync::mpsc;

/// Waits for every issued guard to be dropped.
pub struct CompletionTracker {
    tx: mpsc::Sender<()>,
    rx: mpsc::Receiver<()>,
}

/// One loop's slot in a `CompletionTracker`.
pub struct CompletionGuard {
    name: String,
    _tx: mpsc::Sender<()>,
}

impl CompletionTracker {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self { tx, rx }
    }

    /// Issue a guard for a named loop.
    pub fn guard(&self, name: impl Into<String>) -> CompletionGuard {
        CompletionGuard {
            name: name.into(),
            _tx: self.tx.clone(),
        }
    }

    /// Resolve once all issued guards are gone.
    pub async fn wait(self) {
        let Self { tx, mut rx } = self;
        drop(tx);
        let _ = rx.recv().await;
    }
}

impl Default for CompletionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionGuard {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        tracing::debug!(loop_name = %self.name, "Loop released completion slot");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_wait_without_guards_returns() {
        CompletionTracker::new().wait().await;
    }

    #[tokio::test]
    async fn test_wait_blocks_until_all_guards_dropped() {
        let tracker = CompletionTracker::new();
        let first = tracker.guard("posts");
        let second = tracker.guard("follows");
        assert_eq!(first.name(), "posts");

        let waiting = tokio::spawn(tracker.wait());

        drop(first);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        drop(second);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .expect("tracker should complete")
            .unwrap();
    }

    #[tokio::test]
    async fn test_panicking_task_releases_guard() {
        let tracker = CompletionTracker::new();
        let guard = tracker.guard("doomed");

        let handle: tokio::task::JoinHandle<()> = tokio::spawn(async move {
            let _guard = guard;
            panic!("loop blew up");
        });
        assert!(handle.await.is_err());

        tokio::time::timeout(Duration::from_secs(1), tracker.wait())
            .await
            .expect("guard should be released by unwinding");
    }
}
