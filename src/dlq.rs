//! Dead letters for messages that keep failing.
//!
//! With a `max_receives` redrive policy configured, a message that fails on
//! its last allowed receive is written to a dead-letter sink and then
//! acknowledged, so a poison message stops cycling through the workers.
//! Operators inspect the sink and re-enqueue entries by hand.
//!
//! # Example
//!
//! ```rust,ignore
//! use conduit::dlq::{DeadLetters, RedisDeadLetters};
//!
//! let dlq = RedisDeadLetters::for_queue(redis_pool, "conduit:messages");
//! dlq.bury(&message, "conduit:messages", "pipeline step 0 failed").await?;
//!
//! // Later, list failed messages
//! let failed = dlq.list(10, 0).await?;
//! ```

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Mutex;
use tracing::{debug, error, info};

use crate::message::ReceivedMessage;

/// Suffix appended to the queue name to form the dead-letter stream
pub const DLQ_SUFFIX: &str = ":dlq";

/// Maximum entries to keep in the dead-letter stream (older entries are trimmed)
const DLQ_MAX_LEN: usize = 10000;

/// A message stored in the dead-letter sink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    /// Queue the message was consumed from
    pub queue: String,

    /// Original queue message id
    pub original_id: String,

    /// Raw message body
    pub body: String,

    /// Error from the last failed attempt
    pub error: String,

    /// Receives before giving up
    pub receive_count: u32,

    /// ISO 8601 timestamp when the message was dead-lettered
    pub failed_at: String,
}

impl DeadLetter {
    fn new(message: &ReceivedMessage, queue: &str, error: &str) -> Self {
        Self {
            queue: queue.to_string(),
            original_id: message.id.clone(),
            body: message.body.clone(),
            error: error.to_string(),
            receive_count: message.receive_count,
            failed_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Errors that can occur when writing or reading dead letters.
#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    #[error("Redis command error: {0}")]
    RedisError(String),
}

/// Destination for messages that exhausted their receives.
#[async_trait]
pub trait DeadLetters: Send + Sync {
    /// Store `message` with the reason it failed, returning the entry id.
    async fn bury(
        &self,
        message: &ReceivedMessage,
        queue: &str,
        error: &str,
    ) -> Result<String, DeadLetterError>;
}

/// Dead letters kept in a capped Redis stream.
#[derive(Clone)]
pub struct RedisDeadLetters {
    pool: Pool,
    stream: String,
}

impl RedisDeadLetters {
    /// Dead letters for `queue`, stored in the stream `<queue>:dlq`.
    pub fn for_queue(pool: Pool, queue: &str) -> Self {
        Self {
            pool,
            stream: format!("{queue}{DLQ_SUFFIX}"),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, DeadLetterError> {
        self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for dead letters");
            DeadLetterError::ConnectionError(e.to_string())
        })
    }

    /// Get the count of dead letters.
    pub async fn count(&self) -> Result<u64, DeadLetterError> {
        let mut conn = self.connection().await?;

        cmd("XLEN")
            .arg(&self.stream)
            .query_async(&mut conn)
            .await
            .map_err(|e| DeadLetterError::RedisError(e.to_string()))
    }

    /// List dead letters, oldest first.
    ///
    /// Returns a list of (stream_id, entry) tuples.
    pub async fn list(
        &self,
        count: usize,
        offset: usize,
    ) -> Result<Vec<(String, Value)>, DeadLetterError> {
        let mut conn = self.connection().await?;

        let entries: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
            .arg(&self.stream)
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count + offset)
            .query_async(&mut conn)
            .await
            .map_err(|e| DeadLetterError::RedisError(e.to_string()))?;

        let result: Vec<(String, Value)> = entries
            .into_iter()
            .skip(offset)
            .take(count)
            .map(|(id, fields)| (id, entry_to_json(fields)))
            .collect();

        debug!(count = result.len(), "Retrieved dead letters");
        Ok(result)
    }

    /// Remove a dead letter (after manual review or re-enqueue).
    pub async fn remove(&self, id: &str) -> Result<bool, DeadLetterError> {
        let mut conn = self.connection().await?;

        let removed: u64 = cmd("XDEL")
            .arg(&self.stream)
            .arg(id)
            .query_async(&mut conn)
            .await
            .map_err(|e| DeadLetterError::RedisError(e.to_string()))?;

        if removed > 0 {
            info!(id = %id, "Removed dead letter");
            Ok(true)
        } else {
            debug!(id = %id, "Dead letter not found");
            Ok(false)
        }
    }
}

#[async_trait]
impl DeadLetters for RedisDeadLetters {
    async fn bury(
        &self,
        message: &ReceivedMessage,
        queue: &str,
        error: &str,
    ) -> Result<String, DeadLetterError> {
        let mut conn = self.connection().await?;
        let letter = DeadLetter::new(message, queue, error);

        // MAXLEN keeps the stream from growing without bound
        let id: String = cmd("XADD")
            .arg(&self.stream)
            .arg("MAXLEN")
            .arg("~")
            .arg(DLQ_MAX_LEN)
            .arg("*")
            .arg("queue")
            .arg(&letter.queue)
            .arg("originalId")
            .arg(&letter.original_id)
            .arg("body")
            .arg(&letter.body)
            .arg("error")
            .arg(&letter.error)
            .arg("receiveCount")
            .arg(letter.receive_count)
            .arg("failedAt")
            .arg(&letter.failed_at)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to add message to dead letters");
                DeadLetterError::RedisError(e.to_string())
            })?;

        info!(
            dlq_id = %id,
            original_id = %letter.original_id,
            queue = %queue,
            receive_count = letter.receive_count,
            "Message moved to dead letters"
        );

        Ok(id)
    }
}

/// Convert stream fields into a JSON object, parsing numeric receive counts.
fn entry_to_json(fields: Vec<(String, String)>) -> Value {
    let mut obj = serde_json::Map::new();
    for (key, value) in fields {
        if key == "receiveCount" {
            if let Ok(n) = value.parse::<u32>() {
                obj.insert(key, json!(n));
                continue;
            }
        }
        obj.insert(key, Value::String(value));
    }
    Value::Object(obj)
}

/// Dead letters kept in memory, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryDeadLetters {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DeadLetters for MemoryDeadLetters {
    async fn bury(
        &self,
        message: &ReceivedMessage,
        queue: &str,
        error: &str,
    ) -> Result<String, DeadLetterError> {
        let mut letters = self
            .letters
            .lock()
            .map_err(|e| DeadLetterError::ConnectionError(e.to_string()))?;
        letters.push(DeadLetter::new(message, queue, error));
        Ok(format!("dead-{}", letters.len()))
    }
}
