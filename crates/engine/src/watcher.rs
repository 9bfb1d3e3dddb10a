//! Collection watcher: the shared "watch, filter to added, react" loop.
//!
//! Each watcher owns one change feed subscription and moves through two
//! states:
//! 1. `AwaitingInitialSnapshot`: the first snapshot describes pre-existing
//!    documents and is discarded as a whole
//! 2. `Active`: every `Added` change is handed to the `Reaction`; modified
//!    and removed changes are ignored
//!
//! A failing reaction only skips its own document.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use outliner_common::error::AppError;
use outliner_common::types::{ChangeKind, Document, Snapshot};
use outliner_store::{ChangeFeed, FeedError};

use crate::completion::CompletionGuard;

/// Per-collection reaction to a newly added document.
#[async_trait]
pub trait Reaction: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// React to one added document.
    async fn react(&self, document: &Document) -> Result<(), AppError>;
}

/// Subscription state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    AwaitingInitialSnapshot,
    Active,
}

/// Why a watcher stopped.
#[derive(Debug)]
pub enum WatchExit {
    /// Deadline exceeded / cancelled; a clean shutdown
    Cancelled,
    /// The feed ended without an error
    FeedClosed,
    Failed(FeedError),
}

/// Watches one collection and runs a `Reaction` for each added document.
pub struct CollectionWatcher<R> {
    collection: String,
    feed: Arc<dyn ChangeFeed>,
    reaction: R,
    state: WatchState,
}

impl<R: Reaction> CollectionWatcher<R> {
    pub fn new(collection: impl Into<String>, feed: Arc<dyn ChangeFeed>, reaction: R) -> Self {
        Self {
            collection: collection.into(),
            feed,
            reaction,
            state: WatchState::AwaitingInitialSnapshot,
        }
    }

    pub fn state(&self) -> WatchState {
        self.state
    }

    /// Run until the feed is cancelled, fails or ends.
    ///
    /// `guard` is held for the whole loop and released on every exit path.
    pub async fn run(mut self, shutdown: CancellationToken, guard: CompletionGuard) -> WatchExit {
        let _guard = guard;
        let mut snapshots = self.feed.subscribe(&self.collection, shutdown);

        tracing::info!(
            collection = %self.collection,
            reaction = self.reaction.name(),
            "Watcher started"
        );

        let exit = loop {
            match snapshots.next().await {
                Some(Ok(snapshot)) => {
                    self.handle_snapshot(&snapshot).await;
                }
                Some(Err(FeedError::DeadlineExceeded)) => break WatchExit::Cancelled,
                Some(Err(e)) => {
                    tracing::error!(
                        collection = %self.collection,
                        error = %e,
                        "Change feed failed, stopping watcher"
                    );
                    break WatchExit::Failed(e);
                }
                None => break WatchExit::FeedClosed,
            }
        };

        tracing::info!(collection = %self.collection, exit = ?exit, "Watcher stopped");
        exit
    }

    /// Process one snapshot. Returns the number of added documents reacted to.
    pub async fn handle_snapshot(&mut self, snapshot: &Snapshot) -> usize {
        if self.state == WatchState::AwaitingInitialSnapshot {
            self.state = WatchState::Active;
            tracing::debug!(
                collection = %self.collection,
                existing = snapshot.changes.len(),
                "Discarded initial snapshot"
            );
            return 0;
        }

        let mut reacted = 0;
        for change in &snapshot.changes {
            if change.kind != ChangeKind::Added {
                tracing::debug!(
                    collection = %self.collection,
                    document_id = %change.document.id,
                    kind = %change.kind,
                    "Ignoring change"
                );
                continue;
            }

            reacted += 1;
            if let Err(e) = self.reaction.react(&change.document).await {
                tracing::warn!(
                    collection = %self.collection,
                    document_id = %change.document.id,
                    error = %e,
                    "Reaction failed, skipping document"
                );
            }
        }

        reacted
    }
}
