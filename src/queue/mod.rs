//! Work queue abstraction.
//!
//! Conduit consumes from a queue with "visibility timeout + long poll"
//! semantics: a received message stays invisible to other consumers for the
//! visibility timeout, and reappears unless it is deleted before then. That
//! gives at-least-once delivery across any number of workers.
//!
//! ## Backends
//!
//! - [`RedisQueue`]: Redis Streams with a consumer group
//! - [`MemoryQueue`]: in-process queue used by tests and embedding

pub mod memory;
pub mod redis;

use crate::message::ReceivedMessage;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use memory::MemoryQueue;
pub use redis::RedisQueue;

/// Errors raised by a queue backend.
#[derive(Error, Debug)]
pub enum QueueError {
    /// Backend could not be reached
    #[error("queue '{queue}' unavailable: {message}")]
    Unavailable { queue: String, message: String },

    /// Backend was reached but rejected the command
    #[error("queue '{queue}' {operation} failed: {message}")]
    Command {
        queue: String,
        operation: String,
        message: String,
    },
}

/// Parameters of a single receive call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveOptions {
    /// Upper bound on the batch size
    pub max_messages: usize,

    /// How long to block waiting for the first message; zero returns at once
    pub wait_time: Duration,

    /// How long received messages stay hidden from other consumers
    pub visibility_timeout: Duration,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            max_messages: 10,
            wait_time: Duration::from_secs(20),
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

/// A visibility-timeout queue.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Long-poll for up to `options.max_messages` messages.
    ///
    /// Returns an empty batch when nothing arrived within the wait time.
    async fn receive(&self, options: ReceiveOptions) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Acknowledge a message so it is never delivered again.
    async fn delete(&self, ack_token: &str) -> Result<(), QueueError>;
}
