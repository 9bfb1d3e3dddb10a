use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Kind of change reported by a change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

impl std::fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeKind::Added => write!(f, "added"),
            ChangeKind::Modified => write!(f, "modified"),
            ChangeKind::Removed => write!(f, "removed"),
        }
    }
}

/// A document read from the store, with its fields already converted to plain JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    /// Last path segment of the document name
    pub id: String,
    /// Field map as a JSON object
    pub fields: serde_json::Value,
    pub create_time: Option<DateTime<Utc>>,
    pub update_time: Option<DateTime<Utc>>,
}

impl Document {
    pub fn new(id: impl Into<String>, fields: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            fields,
            create_time: None,
            update_time: None,
        }
    }

    /// Decode the field map into a typed record.
    ///
    /// A missing or mistyped required field fails with `AppError::Decode`
    /// naming the document.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, AppError> {
        serde_json::from_value(self.fields.clone())
            .map_err(|e| AppError::Decode(format!("document {}: {}", self.id, e)))
    }
}

/// One change inside a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: Document,
}

/// One batch delivered by a change feed.
///
/// The first snapshot of a subscription describes pre-existing state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub changes: Vec<DocumentChange>,
    pub read_time: Option<DateTime<Utc>>,
}

/// A post written by a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Post {
    /// Author identifier (document id in the users collection)
    pub user_id: String,
    pub content: String,
}

/// A follower → followed relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FollowRelationship {
    pub follower_id: String,
    /// The user being followed, who receives the notification
    pub following_id: String,
}

/// A user profile with its registered devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub username: String,
    #[serde(default)]
    pub device_tokens: Vec<String>,
}

/// A push notification addressed to several devices at once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    pub title: String,
    pub body: String,
    /// Target device tokens (may be empty)
    pub tokens: Vec<String>,
}

/// Outcome of sending to a single device token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendResponse {
    pub token: String,
    /// Gateway message id on success
    pub message_id: Option<String>,
    /// Error detail on failure
    pub error: Option<String>,
}

impl SendResponse {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Aggregate outcome of one multicast send.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub success_count: usize,
    pub failure_count: usize,
    pub responses: Vec<SendResponse>,
}

impl DeliveryReport {
    pub fn from_responses(responses: Vec<SendResponse>) -> Self {
        let success_count = responses.iter().filter(|r| r.is_success()).count();
        Self {
            success_count,
            failure_count: responses.len() - success_count,
            responses,
        }
    }
}
