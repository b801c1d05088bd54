//! Webhook Transform - HTTP POST of each message to an external URL.
//!
//! The [`WebhookTransform`] forwards messages to an HTTP endpoint (an archive,
//! an analytics collector) before they are routed to the device. The message
//! passes through unchanged when the endpoint accepts it; any other outcome
//! fails the step so the message is retried later.
//!
//! # Example
//!
//! ```rust,ignore
//! use conduit::pipeline::WebhookTransform;
//! use std::time::Duration;
//!
//! let step = WebhookTransform::new("https://archive.example.com/ingest")
//!     .with_timeout(Duration::from_secs(10))
//!     .with_retries(2);
//! ```

use super::{Transform, TransformError};
use crate::message::Message;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for webhook requests
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default number of retries on 5xx errors
const DEFAULT_RETRIES: u32 = 1;

/// A step that POSTs each message to an HTTP endpoint.
///
/// # Features
///
/// - Configurable timeout
/// - Automatic retry on 5xx errors and transport errors
/// - No retry on 4xx
#[derive(Debug, Clone)]
pub struct WebhookTransform {
    /// Target URL for the webhook
    url: String,

    /// HTTP client (reused for connection pooling)
    client: Client,

    /// Request timeout
    timeout: Duration,

    /// Number of retries on 5xx errors
    retries: u32,
}

impl WebhookTransform {
    /// Create a new WebhookTransform targeting the given URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: Client::new(),
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }

    /// Set custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set number of retries on 5xx errors
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    fn build_payload(&self, message: &Message) -> Value {
        json!({
            "messageId": message.id,
            "deviceId": message.device_id(),
            "receiveCount": message.receive_count,
            "body": message.body,
        })
    }

    /// Execute the webhook request with retries
    async fn send_request(&self, message: &Message) -> Result<reqwest::StatusCode, TransformError> {
        let payload = self.build_payload(message);

        let mut last_error = None;
        let mut attempts = 0;

        while attempts <= self.retries {
            if attempts > 0 {
                debug!(
                    attempt = attempts,
                    max_retries = self.retries,
                    "Retrying webhook request"
                );
            }

            let result = self
                .client
                .post(&self.url)
                .timeout(self.timeout)
                .json(&payload)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(status);
                    }

                    // Client error - don't retry
                    if status.is_client_error() {
                        warn!(
                            status = %status,
                            url = %self.url,
                            "Webhook returned client error"
                        );
                        return Err(TransformError::rejected(format!(
                            "webhook returned status {status}"
                        )));
                    }

                    warn!(
                        status = %status,
                        url = %self.url,
                        attempt = attempts,
                        "Webhook returned server error, will retry"
                    );
                    last_error = Some(TransformError::rejected(format!(
                        "webhook returned status {status}"
                    )));
                }
                Err(e) if e.is_timeout() => {
                    warn!(url = %self.url, attempt = attempts, "Webhook request timed out");
                    last_error = Some(TransformError::Timeout(self.timeout.as_millis() as u64));
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        url = %self.url,
                        attempt = attempts,
                        "Webhook request failed"
                    );
                    last_error = Some(TransformError::Http(e));
                }
            }

            attempts += 1;
        }

        Err(last_error.unwrap_or_else(|| TransformError::rejected("webhook not attempted")))
    }
}

#[async_trait]
impl Transform for WebhookTransform {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn transform(&self, message: Message) -> Result<Message, TransformError> {
        debug!(url = %self.url, message_id = %message.id, "Sending webhook");

        let status = self.send_request(&message).await?;
        info!(
            url = %self.url,
            status = %status,
            message_id = %message.id,
            "Webhook delivered successfully"
        );

        Ok(message)
    }
}
