//! Log Transform - Structured logging of messages.
//!
//! The [`LogTransform`] logs each message passing through the pipeline with
//! `tracing` and hands it on unchanged. Useful for debugging and audit trails.
//!
//! # Example
//!
//! ```rust,ignore
//! use conduit::pipeline::LogTransform;
//!
//! let step = LogTransform::new();
//! // or with custom prefix
//! let step = LogTransform::with_prefix("audit");
//! ```

use super::{Transform, TransformError};
use crate::message::Message;
use async_trait::async_trait;
use tracing::info;

/// A pass-through step that logs every message.
#[derive(Debug, Clone)]
pub struct LogTransform {
    /// Prefix for log messages
    prefix: String,
}

impl LogTransform {
    /// Create a LogTransform with the default "message" prefix
    pub fn new() -> Self {
        Self {
            prefix: "message".to_string(),
        }
    }

    /// Create a LogTransform with a custom prefix
    ///
    /// The prefix distinguishes several log steps in one pipeline
    /// (e.g., "inbound", "audit").
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for LogTransform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transform for LogTransform {
    fn name(&self) -> &str {
        "log"
    }

    async fn transform(&self, message: Message) -> Result<Message, TransformError> {
        info!(
            prefix = %self.prefix,
            message_id = %message.id,
            device_id = ?message.device_id(),
            receive_count = message.receive_count,
            body = %message.body,
            "[{}] Processed: {}",
            self.prefix,
            message.id
        );

        Ok(message)
    }
}
