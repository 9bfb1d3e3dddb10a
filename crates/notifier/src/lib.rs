//! Push notification delivery.
//!
//! `Dispatcher` turns a title, body and token list into one multicast send
//! through a `PushGateway`. `fcm::FcmClient` is the Firebase Cloud Messaging
//! gateway used in production.

pub mod fcm;

use std::sync::Arc;

use async_trait::async_trait;

use outliner_common::error::AppError;
use outliner_common::types::{DeliveryReport, PushMessage};

/// A push gateway able to address many devices in one call.
#[async_trait]
pub trait PushGateway: Send + Sync {
    /// Send `message` to every token in it.
    ///
    /// An empty token list must produce an empty report, not an error.
    async fn send_multicast(&self, message: &PushMessage) -> Result<DeliveryReport, AppError>;
}

/// Builds and sends a single push message per call.
#[derive(Clone)]
pub struct Dispatcher {
    gateway: Arc<dyn PushGateway>,
}

impl Dispatcher {
    pub fn new(gateway: Arc<dyn PushGateway>) -> Self {
        Self { gateway }
    }

    /// Send one multicast notification. No retry on failure.
    pub async fn dispatch(
        &self,
        title: &str,
        body: &str,
        tokens: Vec<String>,
    ) -> Result<DeliveryReport, AppError> {
        let message = PushMessage {
            title: title.to_string(),
            body: body.to_string(),
            tokens,
        };

        let report = self.gateway.send_multicast(&message).await?;

        if message.tokens.is_empty() {
            tracing::debug!(title, "No device tokens, nothing delivered");
        } else {
            tracing::info!(
                title,
                targeted = message.tokens.len(),
                success_count = report.success_count,
                failure_count = report.failure_count,
                "Notification sent"
            );
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use outliner_common::types::SendResponse;

    #[derive(Default)]
    struct RecordingGateway {
        sent: Mutex<Vec<PushMessage>>,
    }

    #[async_trait]
    impl PushGateway for RecordingGateway {
        async fn send_multicast(&self, message: &PushMessage) -> Result<DeliveryReport, AppError> {
            self.sent.lock().unwrap().push(message.clone());
            Ok(DeliveryReport::from_responses(
                message
                    .tokens
                    .iter()
                    .map(|token| SendResponse {
                        token: token.clone(),
                        message_id: Some(format!("msg-{}", token)),
                        error: None,
                    })
                    .collect(),
            ))
        }
    }

    struct FailingGateway;

    #[async_trait]
    impl PushGateway for FailingGateway {
        async fn send_multicast(&self, _message: &PushMessage) -> Result<DeliveryReport, AppError> {
            Err(AppError::Gateway("connection reset".to_string()))
        }
    }

    #[tokio::test]
    async fn test_dispatch_sends_one_message() {
        let gateway = Arc::new(RecordingGateway::default());
        let dispatcher = Dispatcher::new(gateway.clone());

        let report = dispatcher
            .dispatch("New Mention", "hello", vec!["a".into(), "b".into()])
            .await
            .unwrap();

        assert_eq!(report.success_count, 2);
        let sent = gateway.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "New Mention");
        assert_eq!(sent[0].body, "hello");
        assert_eq!(sent[0].tokens, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_dispatch_with_no_tokens_is_benign() {
        let gateway = Arc::new(RecordingGateway::default());
        let dispatcher = Dispatcher::new(gateway.clone());

        let report = dispatcher.dispatch("New Follower", "x", vec![]).await.unwrap();

        assert_eq!(report, DeliveryReport::default());
        assert_eq!(gateway.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dispatch_reports_gateway_error() {
        let dispatcher = Dispatcher::new(Arc::new(FailingGateway));
        let err = dispatcher
            .dispatch("New Mention", "x", vec!["a".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Gateway(_)));
    }
}
