//! Reaction bodies for the watched collections.
//!
//! - `MentionReaction`: a new post notifies every user it mentions
//! - `FollowReaction`: a new follow notifies the followed user
//!
//! Profiles and tokens are looked up fresh for every document.

use std::sync::Arc;

use async_trait::async_trait;

use outliner_common::error::AppError;
use outliner_common::types::{Document, FollowRelationship, Post, UserProfile};
use outliner_notifier::Dispatcher;
use outliner_store::DocumentStore;

use crate::mentions::extract_mentions;
use crate::watcher::Reaction;

pub const MENTION_TITLE: &str = "New Mention";
pub const FOLLOWER_TITLE: &str = "New Follower";

/// Profile field holding the user's unique handle.
const HANDLE_FIELD: &str = "username";

pub fn mention_body(author: &str, content: &str) -> String {
    format!("New Mention from {}: {}", author, content)
}

pub fn follower_body(follower: &str) -> String {
    format!("You have a new follower: {}", follower)
}

/// Fetch and decode a profile by document id; a missing profile is an error.
async fn fetch_profile(
    store: &dyn DocumentStore,
    users_collection: &str,
    user_id: &str,
) -> Result<UserProfile, AppError> {
    store
        .get_document(users_collection, user_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("user {}", user_id)))?
        .decode()
}

/// Notifies users mentioned in a new post.
pub struct MentionReaction {
    store: Arc<dyn DocumentStore>,
    dispatcher: Dispatcher,
    users_collection: String,
}

impl MentionReaction {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        dispatcher: Dispatcher,
        users_collection: impl Into<String>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            users_collection: users_collection.into(),
        }
    }

    /// Look up the profile owning `handle`, if any.
    async fn find_by_handle(&self, handle: &str) -> Result<Option<UserProfile>, AppError> {
        let matches = self
            .store
            .query_by_field(&self.users_collection, HANDLE_FIELD, handle, 1)
            .await?;

        matches
            .first()
            .map(|doc| doc.decode::<UserProfile>())
            .transpose()
    }
}

#[async_trait]
impl Reaction for MentionReaction {
    fn name(&self) -> &'static str {
        "mentions"
    }

    async fn react(&self, document: &Document) -> Result<(), AppError> {
        let post: Post = document.decode()?;
        let author =
            fetch_profile(self.store.as_ref(), &self.users_collection, &post.user_id).await?;

        let handles = extract_mentions(&post.content);
        if handles.is_empty() {
            return Ok(());
        }

        let body = mention_body(&author.username, &post.content);

        for handle in &handles {
            let recipient = match self.find_by_handle(handle).await {
                Ok(Some(profile)) => profile,
                Ok(None) => {
                    tracing::debug!(
                        post_id = %document.id,
                        handle = %handle,
                        "Mentioned handle has no profile"
                    );
                    continue;
                }
                Err(e) => {
                    tracing::warn!(
                        post_id = %document.id,
                        handle = %handle,
                        error = %e,
                        "Mentioned handle lookup failed"
                    );
                    continue;
                }
            };

            if let Err(e) = self
                .dispatcher
                .dispatch(MENTION_TITLE, &body, recipient.device_tokens)
                .await
            {
                tracing::warn!(
                    post_id = %document.id,
                    handle = %handle,
                    error = %e,
                    "Failed to send mention notification"
                );
            }
        }

        Ok(())
    }
}

/// Notifies a user when someone follows them.
pub struct FollowReaction {
    store: Arc<dyn DocumentStore>,
    dispatcher: Dispatcher,
    users_collection: String,
}

impl FollowReaction {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        dispatcher: Dispatcher,
        users_collection: impl Into<String>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            users_collection: users_collection.into(),
        }
    }
}

#[async_trait]
impl Reaction for FollowReaction {
    fn name(&self) -> &'static str {
        "follows"
    }

    async fn react(&self, document: &Document) -> Result<(), AppError> {
        let follow: FollowRelationship = document.decode()?;
        let store = self.store.as_ref();

        let follower = fetch_profile(store, &self.users_collection, &follow.follower_id).await?;
        let followed = fetch_profile(store, &self.users_collection, &follow.following_id).await?;

        if let Err(e) = self
            .dispatcher
            .dispatch(
                FOLLOWER_TITLE,
                &follower_body(&follower.username),
                followed.device_tokens,
            )
            .await
        {
            tracing::warn!(
                follow_id = %document.id,
                user_id = %follow.following_id,
                error = %e,
                "Failed to send follower notification"
            );
        }

        Ok(())
    }
}
