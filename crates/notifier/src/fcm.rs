//! Firebase Cloud Messaging (HTTP v1) gateway.
//!
//! The v1 API has no batch endpoint, so a multicast is fanned out as one
//! `messages:send` request per token with bounded concurrency, and the
//! individual results are folded into a `DeliveryReport`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use outliner_common::credentials::TokenSource;
use outliner_common::error::AppError;
use outliner_common::types::{DeliveryReport, PushMessage, SendResponse};

use crate::PushGateway;

#[derive(Debug, Deserialize)]
struct SendResult {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorStatus,
}

#[derive(Debug, Deserialize)]
struct ErrorStatus {
    status: Option<String>,
    message: Option<String>,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorDetail {
    error_code: Option<String>,
}

/// Build the `messages:send` body for one device.
pub fn build_send_body(token: &str, title: &str, body: &str) -> serde_json::Value {
    json!({
        "message": {
            "token": token,
            "notification": {
                "title": title,
                "body": body
            }
        }
    })
}

/// Summarise an FCM error response, preferring the FCM-specific error code
/// (e.g. `UNREGISTERED`) over the generic RPC status.
pub fn describe_error(status: reqwest::StatusCode, body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) => {
            let code = envelope
                .error
                .details
                .iter()
                .find_map(|d| d.error_code.clone())
                .or(envelope.error.status)
                .unwrap_or_else(|| status.to_string());
            match envelope.error.message {
                Some(message) => format!("{}: {}", code, message),
                None => code,
            }
        }
        Err(_) => format!("{}: {}", status, body),
    }
}

/// FCM HTTP v1 client.
pub struct FcmClient {
    http: Client,
    base_url: String,
    project_id: String,
    tokens: Arc<TokenSource>,
    max_concurrency: usize,
}

impl FcmClient {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        project_id: impl Into<String>,
        tokens: Arc<TokenSource>,
        max_concurrency: usize,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            project_id: project_id.into(),
            tokens,
            max_concurrency: max_concurrency.max(1),
        }
    }

    pub fn send_url(&self) -> String {
        format!("{}/projects/{}/messages:send", self.base_url, self.project_id)
    }

    /// Send to a single device. `Err` means the gateway could not be reached;
    /// a rejection by the gateway is an `Ok` response carrying the error.
    async fn send_one(
        &self,
        url: &str,
        bearer: &str,
        message: &PushMessage,
        token: &str,
    ) -> Result<SendResponse, reqwest::Error> {
        let response = self
            .http
            .post(url)
            .bearer_auth(bearer)
            .json(&build_send_body(token, &message.title, &message.body))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let result: SendResult = response.json().await?;
            return Ok(SendResponse {
                token: token.to_string(),
                message_id: Some(result.name),
                error: None,
            });
        }

        let body = response.text().await.unwrap_or_default();
        let error = describe_error(status, &body);
        tracing::debug!(
            token_prefix = token.get(..8).unwrap_or(token),
            error = %error,
            "FCM rejected token"
        );

        Ok(SendResponse {
            token: token.to_string(),
            message_id: None,
            error: Some(error),
        })
    }
}

#[async_trait]
impl PushGateway for FcmClient {
    async fn send_multicast(&self, message: &PushMessage) -> Result<DeliveryReport, AppError> {
        if message.tokens.is_empty() {
            return Ok(DeliveryReport::default());
        }

        let bearer = self.tokens.bearer().await?;
        let url = self.send_url();

        let sends: Vec<_> = message
            .tokens
            .iter()
            .map(|token| self.send_one(&url, &bearer, message, token))
            .collect();
        let results: Vec<Result<SendResponse, reqwest::Error>> =
            futures::stream::iter(sends)
                .buffered(self.max_concurrency)
                .collect()
                .await;

        if results.iter().all(|r| r.is_err()) {
            let first = results
                .into_iter()
                .find_map(|r| r.err())
                .map(|e| e.to_string())
                .unwrap_or_default();
            return Err(AppError::Gateway(format!(
                "All {} sends failed: {}",
                message.tokens.len(),
                first
            )));
        }

        let responses = results
            .into_iter()
            .zip(message.tokens.iter())
            .map(|(result, token)| {
                result.unwrap_or_else(|e| SendResponse {
                    token: token.clone(),
                    message_id: None,
                    error: Some(e.to_string()),
                })
            })
            .collect();

        Ok(DeliveryReport::from_responses(responses))
    }
}
