pub mod feed;
pub mod firestore;
pub mod value;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use outliner_common::error::AppError;
use outliner_common::types::{Document, Snapshot};

/// Errors surfaced by a change feed subscription.
#[derive(Debug, Error)]
pub enum FeedError {
    /// The subscription's context was cancelled or timed out.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("feed transport error: {0}")]
    Transport(#[from] AppError),
}

/// Live sequence of snapshots for one collection.
pub type SnapshotStream = BoxStream<'static, Result<Snapshot, FeedError>>;

/// Read access to documents by id or by field value.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a single document. Returns `None` if it does not exist.
    async fn get_document(&self, collection: &str, id: &str)
    -> Result<Option<Document>, AppError>;

    /// Find up to `limit` documents whose string field equals `value`.
    async fn query_by_field(
        &self,
        collection: &str,
        field: &str,
        value: &str,
        limit: usize,
    ) -> Result<Vec<Document>, AppError>;
}

/// Subscription to a collection's change events.
pub trait ChangeFeed: Send + Sync {
    /// Start watching a collection.
    ///
    /// The first snapshot carries every pre-existing document. Once `shutdown`
    /// is cancelled the stream yields `FeedError::DeadlineExceeded` and ends.
    fn subscribe(&self, collection: &str, shutdown: CancellationToken) -> SnapshotStream;
}
