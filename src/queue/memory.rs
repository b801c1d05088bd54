use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use super::{Queue, QueueError, ReceiveOptions};
use crate::message::ReceivedMessage;

#[derive(Debug, Clone)]
struct Entry {
    /// Send order
    seq: u64,
    id: String,
    body: String,
    receive_count: u32,
}

#[derive(Debug)]
struct InFlight {
    entry: Entry,
    visible_at: Instant,
}

#[derive(Debug, Default)]
struct Inner {
    ready: VecDeque<Entry>,
    /// Keyed by receipt token
    in_flight: HashMap<String, InFlight>,
    deleted: Vec<String>,
    next_id: u64,
}

impl Inner {
    /// Move messages whose visibility timeout elapsed back to the front,
    /// keeping send order among them.
    fn restore_expired(&mut self, now: Instant) {
        let tokens: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, flight)| flight.visible_at <= now)
            .map(|(token, _)| token.clone())
            .collect();

        let mut expired: Vec<Entry> = tokens
            .iter()
            .filter_map(|token| self.in_flight.remove(token))
            .map(|flight| flight.entry)
            .collect();
        expired.sort_by_key(|entry| entry.seq);

        for entry in expired.into_iter().rev() {
            debug!(id = %entry.id, "Visibility timeout elapsed, message visible again");
            self.ready.push_front(entry);
        }
    }

    fn take(&mut self, options: &ReceiveOptions, now: Instant) -> Vec<ReceivedMessage> {
        let mut batch = Vec::new();

        while batch.len() < options.max_messages {
            let Some(mut entry) = self.ready.pop_front() else {
                break;
            };
            entry.receive_count += 1;

            let token = format!("{}#{}", entry.id, entry.receive_count);
            batch.push(
                ReceivedMessage::new(entry.id.clone(), entry.body.clone())
                    .with_ack_token(token.clone())
                    .with_receive_count(entry.receive_count),
            );
            self.in_flight.insert(
                token,
                InFlight {
                    entry,
                    visible_at: now + options.visibility_timeout,
                },
            );
        }

        batch
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.in_flight.values().map(|flight| flight.visible_at).min()
    }
}

/// In-process queue with visibility-timeout semantics.
///
/// Receipt tokens are unique per delivery, so a token from a delivery whose
/// visibility timeout already elapsed no longer deletes the message.
#[derive(Debug)]
pub struct MemoryQueue {
    name: String,
    inner: Mutex<Inner>,
    notify: Notify,
    unavailable: AtomicBool,
    receive_calls: AtomicUsize,
}

impl MemoryQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
            unavailable: AtomicBool::new(false),
            receive_calls: AtomicUsize::new(0),
        }
    }

    /// Enqueue a message body, returning its id.
    pub async fn send(&self, body: impl Into<String>) -> String {
        let mut inner = self.inner.lock().await;
        inner.next_id += 1;
        let id = format!("msg-{}", inner.next_id);
        let seq = inner.next_id;
        inner.ready.push_back(Entry {
            seq,
            id: id.clone(),
            body: body.into(),
            receive_count: 0,
        });
        drop(inner);

        self.notify.notify_waiters();
        id
    }

    /// Simulate the backend going away (or coming back).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Messages waiting to be received
    pub async fn visible(&self) -> usize {
        self.inner.lock().await.ready.len()
    }

    /// Messages received but not yet deleted or expired
    pub async fn in_flight(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }

    /// Ids of deleted messages, in deletion order
    pub async fn deleted(&self) -> Vec<String> {
        self.inner.lock().await.deleted.clone()
    }

    /// Number of `receive` calls made so far
    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    fn check_available(&self, operation: &str) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Unavailable {
                queue: self.name.clone(),
                message: format!("{operation}: backend offline"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(&self, options: ReceiveOptions) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        self.check_available("receive")?;

        let deadline = Instant::now() + options.wait_time;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut inner = self.inner.lock().await;
                let now = Instant::now();
                inner.restore_expired(now);

                let batch = inner.take(&options, now);
                if !batch.is_empty() || now >= deadline {
                    return Ok(batch);
                }

                inner
                    .next_expiry()
                    .map_or(deadline, |expiry| expiry.min(deadline))
            };

            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    async fn delete(&self, ack_token: &str) -> Result<(), QueueError> {
        self.check_available("delete")?;

        let mut inner = self.inner.lock().await;
        match inner.in_flight.remove(ack_token) {
            Some(flight) => inner.deleted.push(flight.entry.id),
            None => debug!(ack_token = %ack_token, "Delete for unknown or expired receipt ignored"),
        }
        Ok(())
    }
}
