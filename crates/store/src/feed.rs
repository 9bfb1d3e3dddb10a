//! Polling change feed.
//!
//! Lists the watched collection every `poll_interval` and diffs the listing
//! against the previous one to produce added/modified/removed changes. The
//! first listing is delivered as the initial snapshot. Between polls only each
//! document's id and update time are kept.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use outliner_common::error::AppError;
use outliner_common::types::{ChangeKind, Document, DocumentChange, Snapshot};

use crate::firestore::FirestoreClient;
use crate::{ChangeFeed, FeedError, SnapshotStream};

/// Anything that can list a whole collection.
#[async_trait]
pub trait CollectionSource: Send + Sync {
    async fn list(&self, collection: &str) -> Result<Vec<Document>, AppError>;
}

#[async_trait]
impl CollectionSource for FirestoreClient {
    async fn list(&self, collection: &str) -> Result<Vec<Document>, AppError> {
        self.list_documents(collection).await
    }
}

/// Change feed that polls a `CollectionSource`.
pub struct PollingFeed<S> {
    source: Arc<S>,
    poll_interval: Duration,
}

impl<S: CollectionSource + 'static> PollingFeed<S> {
    pub fn new(source: Arc<S>, poll_interval_ms: u64) -> Self {
        Self {
            source,
            poll_interval: Duration::from_millis(poll_interval_ms),
        }
    }
}

impl<S: CollectionSource + 'static> ChangeFeed for PollingFeed<S> {
    fn subscribe(&self, collection: &str, shutdown: CancellationToken) -> SnapshotStream {
        tracing::info!(
            collection,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Change feed subscribed"
        );

        let state = PollState {
            source: Arc::clone(&self.source),
            collection: collection.to_string(),
            poll_interval: self.poll_interval,
            shutdown,
            previous: None,
            finished: false,
        };

        futures::stream::unfold(state, |mut state| async move {
            let item = state.next_snapshot().await?;
            Some((item, state))
        })
        .boxed()
    }
}

struct PollState<S> {
    source: Arc<S>,
    collection: String,
    poll_interval: Duration,
    shutdown: CancellationToken,
    /// Update time of every document in the last listing, keyed by id.
    /// `None` until the initial snapshot.
    previous: Option<HashMap<String, Option<DateTime<Utc>>>>,
    finished: bool,
}

impl<S: CollectionSource> PollState<S> {
    /// Poll until there is something to deliver. Returns `None` once the
    /// stream has ended.
    async fn next_snapshot(&mut self) -> Option<Result<Snapshot, FeedError>> {
        if self.finished {
            return None;
        }

        loop {
            if self.previous.is_some() {
                tokio::select! {
                    _ = self.shutdown.cancelled() => return Some(self.finish(FeedError::DeadlineExceeded)),
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }

            let listed = tokio::select! {
                _ = self.shutdown.cancelled() => return Some(self.finish(FeedError::DeadlineExceeded)),
                listed = self.source.list(&self.collection) => listed,
            };

            let documents = match listed {
                Ok(documents) => documents,
                Err(e) => return Some(self.finish(FeedError::Transport(e))),
            };

            let changes = match &self.previous {
                None => documents
                    .iter()
                    .cloned()
                    .map(|document| DocumentChange {
                        kind: ChangeKind::Added,
                        document,
                    })
                    .collect(),
                Some(previous) => diff_documents(previous, &documents),
            };
            let initial = self.previous.is_none();

            self.previous = Some(
                documents
                    .into_iter()
                    .map(|doc| (doc.id, doc.update_time))
                    .collect(),
            );

            tracing::debug!(
                collection = %self.collection,
                changes = changes.len(),
                initial,
                "Polled collection"
            );

            if initial || !changes.is_empty() {
                return Some(Ok(Snapshot {
                    changes,
                    read_time: Some(Utc::now()),
                }));
            }
        }
    }

    fn finish(&mut self, error: FeedError) -> Result<Snapshot, FeedError> {
        self.finished = true;
        Err(error)
    }
}

/// Compute the changes between two listings of the same collection.
///
/// `previous` maps each id to its update time in the earlier listing; a
/// document counts as modified when its update time moved. Added and modified
/// documents are ordered by update time, removals follow ordered by id and
/// carry no fields.
pub fn diff_documents(
    previous: &HashMap<String, Option<DateTime<Utc>>>,
    current: &[Document],
) -> Vec<DocumentChange> {
    let mut changes: Vec<DocumentChange> = current
        .iter()
        .filter_map(|doc| match previous.get(&doc.id) {
            None => Some(DocumentChange {
                kind: ChangeKind::Added,
                document: doc.clone(),
            }),
            Some(old) if *old != doc.update_time => Some(DocumentChange {
                kind: ChangeKind::Modified,
                document: doc.clone(),
            }),
            Some(_) => None,
        })
        .collect();
    changes.sort_by_key(|c| c.document.update_time);

    let current_ids: HashSet<&str> = current.iter().map(|d| d.id.as_str()).collect();
    let mut removed: Vec<(&String, &Option<DateTime<Utc>>)> = previous
        .iter()
        .filter(|(id, _)| !current_ids.contains(id.as_str()))
        .collect();
    removed.sort_by(|a, b| a.0.cmp(b.0));

    changes.extend(removed.into_iter().map(|(id, update_time)| DocumentChange {
        kind: ChangeKind::Removed,
        document: Document {
            update_time: *update_time,
            ..Document::new(id.clone(), serde_json::json!({}))
        },
    }));

    changes
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn doc(id: &str, secs: i64, content: &str) -> Document {
        Document {
            id: id.to_string(),
            fields: serde_json::json!({ "content": content }),
            create_time: Utc.timestamp_opt(secs, 0).single(),
            update_time: Utc.timestamp_opt(secs, 0).single(),
        }
    }

    fn index(docs: &[Document]) -> HashMap<String, Option<DateTime<Utc>>> {
        docs.iter().map(|d| (d.id.clone(), d.update_time)).collect()
    }

    /// Returns scripted listings in order, then repeats the last one.
    struct ScriptedSource {
        listings: Mutex<VecDeque<Result<Vec<Document>, AppError>>>,
        last: Mutex<Vec<Document>>,
    }

    impl ScriptedSource {
        fn new(listings: Vec<Result<Vec<Document>, AppError>>) -> Arc<Self> {
            Arc::new(Self {
                listings: Mutex::new(listings.into()),
                last: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CollectionSource for ScriptedSource {
        async fn list(&self, _collection: &str) -> Result<Vec<Document>, AppError> {
            let next = self.listings.lock().unwrap().pop_front();
            match next {
                Some(Ok(docs)) => {
                    *self.last.lock().unwrap() = docs.clone();
                    Ok(docs)
                }
                Some(Err(e)) => Err(e),
                None => Ok(self.last.lock().unwrap().clone()),
            }
        }
    }

    #[test]
    fn test_diff_detects_added_modified_removed() {
        let before = vec![doc("a", 1, "one"), doc("b", 2, "two"), doc("c", 3, "three")];
        let after = vec![doc("a", 1, "one"), doc("b", 5, "two!"), doc("d", 4, "four")];

        let changes = diff_documents(&index(&before), &after);
        let summary: Vec<(ChangeKind, &str)> = changes
            .iter()
            .map(|c| (c.kind, c.document.id.as_str()))
            .collect();

        assert_eq!(
            summary,
            vec![
                (ChangeKind::Added, "d"),
                (ChangeKind::Modified, "b"),
                (ChangeKind::Removed, "c"),
            ]
        );
    }

    #[test]
    fn test_diff_compares_update_time_only() {
        let before = vec![doc("a", 1, "one")];

        // Same update time, different fields: not a modification.
        assert!(diff_documents(&index(&before), &[doc("a", 1, "edited")]).is_empty());

        let changes = diff_documents(&index(&before), &[doc("a", 2, "one")]);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Modified);
    }

    #[test]
    fn test_removed_change_keeps_id_and_update_time() {
        let before = vec![doc("gone", 7, "bye")];
        let changes = diff_documents(&index(&before), &[]);

        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].kind, ChangeKind::Removed);
        assert_eq!(changes[0].document.id, "gone");
        assert_eq!(changes[0].document.update_time, Utc.timestamp_opt(7, 0).single());
    }

    #[test]
    fn test_diff_orders_additions_by_update_time() {
        let after = vec![doc("late", 9, "x"), doc("early", 1, "y")];
        let changes = diff_documents(&HashMap::new(), &after);
        assert_eq!(changes[0].document.id, "early");
        assert_eq!(changes[1].document.id, "late");
    }

    #[test]
    fn test_diff_identical_listing_is_empty() {
        let docs = vec![doc("a", 1, "one")];
        assert!(diff_documents(&index(&docs), &docs).is_empty());
    }

    #[tokio::test]
    async fn test_initial_snapshot_then_diff() {
        let source = ScriptedSource::new(vec![
            Ok(vec![doc("a", 1, "one"), doc("b", 2, "two")]),
            Ok(vec![doc("a", 1, "one"), doc("b", 2, "two")]),
            Ok(vec![doc("a", 1, "one"), doc("b", 2, "two"), doc("c", 3, "three")]),
        ]);
        let feed = PollingFeed::new(source, 1);
        let mut stream = feed.subscribe("posts", CancellationToken::new());

        let initial = stream.next().await.unwrap().unwrap();
        assert_eq!(initial.changes.len(), 2);
        assert!(initial.changes.iter().all(|c| c.kind == ChangeKind::Added));

        // The unchanged second listing is skipped entirely.
        let next = stream.next().await.unwrap().unwrap();
        assert_eq!(next.changes.len(), 1);
        assert_eq!(next.changes[0].document.id, "c");
    }

    #[tokio::test]
    async fn test_empty_initial_snapshot_is_delivered() {
        let source = ScriptedSource::new(vec![Ok(vec![])]);
        let feed = PollingFeed::new(source, 1);
        let mut stream = feed.subscribe("follows", CancellationToken::new());

        let initial = stream.next().await.unwrap().unwrap();
        assert!(initial.changes.is_empty());
    }

    #[tokio::test]
    async fn test_cancellation_yields_deadline_exceeded_then_ends() {
        let source = ScriptedSource::new(vec![Ok(vec![doc("a", 1, "one")])]);
        let feed = PollingFeed::new(source, 60_000);
        let shutdown = CancellationToken::new();
        let mut stream = feed.subscribe("posts", shutdown.clone());

        stream.next().await.unwrap().unwrap();
        shutdown.cancel();

        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, FeedError::DeadlineExceeded));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_listing_error_ends_stream() {
        let source = ScriptedSource::new(vec![
            Ok(vec![]),
            Err(AppError::Store("permission denied".to_string())),
        ]);
        let feed = PollingFeed::new(source, 1);
        let mut stream = feed.subscribe("posts", CancellationToken::new());

        stream.next().await.unwrap().unwrap();
        let err = stream.next().await.unwrap().unwrap_err();
        assert!(matches!(err, FeedError::Transport(AppError::Store(_))));
        assert!(stream.next().await.is_none());
    }

    /// Serves `pages` to successive requests over plain HTTP, repeating the
    /// last one, and returns the base URL.
    async fn serve_listings(pages: Vec<serde_json::Value>) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let mut pages: VecDeque<_> = pages.into();
            let mut last = serde_json::json!({});
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                if let Some(page) = pages.pop_front() {
                    last = page;
                }

                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }

                let body = last.to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        format!("http://{}/v1", addr)
    }

    fn raw_post(id: &str, update_time: &str, extra: serde_json::Value) -> serde_json::Value {
        let mut fields = serde_json::json!({
            "userId": {"stringValue": "u1"},
            "content": {"stringValue": format!("post {}", id)}
        });
        if let (Some(fields), Some(extra)) = (fields.as_object_mut(), extra.as_object()) {
            fields.extend(extra.clone());
        }
        serde_json::json!({
            "name": format!("projects/p/databases/(default)/documents/posts/{}", id),
            "fields": fields,
            "createTime": update_time,
            "updateTime": update_time
        })
    }

    #[tokio::test]
    async fn test_undecodable_document_does_not_end_stream() {
        let first = serde_json::json!({
            "documents": [raw_post("a", "2024-05-01T10:00:00Z", serde_json::json!({}))]
        });
        let second = serde_json::json!({
            "documents": [
                raw_post("a", "2024-05-01T10:00:00Z", serde_json::json!({})),
                raw_post("b", "2024-05-01T10:05:00Z", serde_json::json!({
                    "embedding": {"vectorValue": {}},
                    "likes": {"integerValue": "many"}
                }))
            ]
        });
        let third = serde_json::json!({
            "documents": [
                raw_post("a", "2024-05-01T10:00:00Z", serde_json::json!({})),
                raw_post("b", "2024-05-01T10:05:00Z", serde_json::json!({
                    "embedding": {"vectorValue": {}},
                    "likes": {"integerValue": "many"}
                })),
                raw_post("c", "2024-05-01T10:10:00Z", serde_json::json!({}))
            ]
        });
        let base_url = serve_listings(vec![first, second, third]).await;

        let client = FirestoreClient::new(
            reqwest::Client::new(),
            base_url,
            "p",
            "(default)",
            Arc::new(outliner_common::credentials::TokenSource::Static("owner".to_string())),
        );
        let feed = PollingFeed::new(Arc::new(client), 1);
        let mut stream = feed.subscribe("posts", CancellationToken::new());

        let initial = stream.next().await.unwrap().unwrap();
        assert_eq!(initial.changes.len(), 1);

        let next = stream.next().await.unwrap().unwrap();
        assert_eq!(next.changes.len(), 1);
        assert_eq!(next.changes[0].kind, ChangeKind::Added);
        assert_eq!(next.changes[0].document.id, "b");
        assert_eq!(next.changes[0].document.fields["userId"], "u1");
        assert_eq!(
            next.changes[0].document.fields["embedding"],
            serde_json::json!({"vectorValue": {}})
        );

        let later = stream.next().await.unwrap().unwrap();
        assert_eq!(later.changes.len(), 1);
        assert_eq!(later.changes[0].document.id, "c");
    }
}
