//! Redis Streams queue backend.
//!
//! Maps the visibility-timeout model onto a stream consumer group:
//!
//! ```text
//! receive  -> XPENDING IDLE <visibility> + XCLAIM   (expired deliveries first)
//!          -> XREADGROUP COUNT n [BLOCK wait] >     (then new entries)
//! delete   -> XACK + XDEL
//! ```
//!
//! A delivered but unacknowledged entry stays in the group's pending list.
//! Once it has been idle for the visibility timeout any worker may claim it,
//! which is what makes a failed message reappear.

use async_trait::async_trait;
use deadpool_redis::redis::streams::{StreamClaimReply, StreamId, StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, pipe, AsyncCommands, RedisError, Value as RedisValue};
use deadpool_redis::Pool;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{Queue, QueueError, ReceiveOptions};
use crate::message::ReceivedMessage;

/// Stream field holding the message body
pub const BODY_FIELD: &str = "body";

/// Queue backed by a Redis stream and consumer group.
#[derive(Clone)]
pub struct RedisQueue {
    pool: Pool,
    stream: String,
    group: String,
    consumer: String,
}

impl RedisQueue {
    /// Connect to `stream`, creating the consumer group if it does not exist.
    pub async fn connect(
        pool: Pool,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let queue = Self {
            pool,
            stream: stream.into(),
            group: group.into(),
            consumer: consumer.into(),
        };
        queue.ensure_group().await?;
        Ok(queue)
    }

    async fn connection(&self) -> Result<deadpool_redis::Connection, QueueError> {
        self.pool.get().await.map_err(|e| QueueError::Unavailable {
            queue: self.stream.clone(),
            message: e.to_string(),
        })
    }

    fn command_error(&self, operation: &str, e: RedisError) -> QueueError {
        if e.is_io_error() || e.is_connection_dropped() || e.is_timeout() {
            QueueError::Unavailable {
                queue: self.stream.clone(),
                message: e.to_string(),
            }
        } else {
            QueueError::Command {
                queue: self.stream.clone(),
                operation: operation.to_string(),
                message: e.to_string(),
            }
        }
    }

    async fn ensure_group(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;

        let created: Result<(), RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => {
                info!(stream = %self.stream, consumer_group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %self.stream, consumer_group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(self.command_error("XGROUP CREATE", e)),
        }
    }

    /// Claim deliveries that have been pending longer than the visibility timeout.
    async fn reclaim(
        &self,
        conn: &mut deadpool_redis::Connection,
        options: &ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let min_idle_ms = options.visibility_timeout.as_millis() as u64;

        // XPENDING key group IDLE ms - + count -> [[id, consumer, idle_ms, delivered], ...]
        let pending: Vec<(String, String, u64, u64)> = cmd("XPENDING")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(options.max_messages)
            .query_async(&mut *conn)
            .await
            .map_err(|e| self.command_error("XPENDING", e))?;

        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let delivered: HashMap<String, u64> = pending
            .into_iter()
            .map(|(id, _consumer, _idle, count)| (id, count))
            .collect();
        let ids: Vec<&String> = delivered.keys().collect();

        let claimed: StreamClaimReply = conn
            .xclaim(&self.stream, &self.group, &self.consumer, min_idle_ms, &ids)
            .await
            .map_err(|e| self.command_error("XCLAIM", e))?;

        let mut messages: Vec<ReceivedMessage> = claimed
            .ids
            .iter()
            .map(|entry| {
                let previous = delivered.get(&entry.id).copied().unwrap_or(0);
                to_received(entry, previous as u32 + 1)
            })
            .collect();
        messages.sort_by(|a, b| compare_stream_ids(&a.id, &b.id));

        if !messages.is_empty() {
            info!(
                stream = %self.stream,
                count = messages.len(),
                "Reclaimed messages past their visibility timeout"
            );
        }
        Ok(messages)
    }

    async fn read_new(
        &self,
        conn: &mut deadpool_redis::Connection,
        options: &ReceiveOptions,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut opts = StreamReadOptions::default()
            .group(&self.group, &self.consumer)
            .count(options.max_messages);

        // BLOCK 0 would wait forever, so a zero wait omits it entirely.
        if !options.wait_time.is_zero() {
            opts = opts.block(options.wait_time.as_millis() as usize);
        }

        let reply: Option<StreamReadReply> = conn
            .xread_options(&[&self.stream], &[">"], &opts)
            .await
            .map_err(|e| self.command_error("XREADGROUP", e))?;

        Ok(reply
            .map(|reply| {
                reply
                    .keys
                    .iter()
                    .flat_map(|key| key.ids.iter())
                    .map(|entry| to_received(entry, 1))
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl Queue for RedisQueue {
    fn name(&self) -> &str {
        &self.stream
    }

    async fn receive(&self, options: ReceiveOptions) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut conn = self.connection().await?;

        let reclaimed = self.reclaim(&mut conn, &options).await?;
        if !reclaimed.is_empty() {
            return Ok(reclaimed);
        }

        self.read_new(&mut conn, &options).await
    }

    async fn delete(&self, ack_token: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;

        let (acked, removed): (u64, u64) = pipe()
            .cmd("XACK")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(ack_token)
            .cmd("XDEL")
            .arg(&self.stream)
            .arg(ack_token)
            .query_async(&mut conn)
            .await
            .map_err(|e| self.command_error("XACK", e))?;

        if acked == 0 {
            warn!(
                stream = %self.stream,
                id = %ack_token,
                removed = removed,
                "Acknowledged message was not pending for this group"
            );
        }
        Ok(())
    }
}

/// Build a received message from a stream entry.
fn to_received(entry: &StreamId, receive_count: u32) -> ReceivedMessage {
    ReceivedMessage::new(entry.id.clone(), get_str_field(&entry.map, BODY_FIELD))
        .with_receive_count(receive_count)
}

/// Extract a string field from Redis stream data.
fn get_str_field(map: &HashMap<String, RedisValue>, key: &str) -> String {
    match map.get(key) {
        Some(RedisValue::BulkString(bytes)) => String::from_utf8_lossy(bytes).to_string(),
        Some(RedisValue::SimpleString(s)) => s.clone(),
        _ => String::new(),
    }
}

/// Order stream ids (`<ms>-<seq>`) numerically.
fn compare_stream_ids(a: &str, b: &str) -> std::cmp::Ordering {
    fn parts(id: &str) -> (u64, u64) {
        let (ms, seq) = id.split_once('-').unwrap_or((id, "0"));
        (ms.parse().unwrap_or(0), seq.parse().unwrap_or(0))
    }
    parts(a).cmp(&parts(b))
}
