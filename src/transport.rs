//! Delivery to live client connections.
//!
//! The connection layer owns the sockets; all conduit needs from it is a way
//! to push a payload at a route handle. [`RedisTransport`] publishes on a
//! Redis channel named by the route, which the connection process holding the
//! socket subscribes to.

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

/// Errors raised while sending to a route.
#[derive(Error, Debug)]
pub enum DeliveryError {
    /// Nobody is listening on the route any more
    #[error("route '{0}' is stale")]
    StaleRoute(String),

    /// The transport backend could not be reached
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// The connection layer's send primitive.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `payload` to the client reachable through `route`.
    async fn send(&self, route: &str, payload: &Value) -> Result<(), DeliveryError>;
}

/// Publishes payloads on the Redis channel named by the route.
#[derive(Clone)]
pub struct RedisTransport {
    pool: Pool,
}

impl RedisTransport {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn send(&self, route: &str, payload: &Value) -> Result<(), DeliveryError> {
        let text = serde_json::to_string(payload)?;

        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| DeliveryError::Unavailable(e.to_string()))?;

        let receivers: u64 = cmd("PUBLISH")
            .arg(route)
            .arg(&text)
            .query_async(&mut conn)
            .await
            .map_err(|e| DeliveryError::Unavailable(e.to_string()))?;

        if receivers == 0 {
            return Err(DeliveryError::StaleRoute(route.to_string()));
        }

        debug!(route = %route, receivers = receivers, "Payload published");
        Ok(())
    }
}

/// A transport that records what it sent, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<(String, Value)>>,
    broken: Mutex<HashSet<String>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sends to `route` fail as stale
    pub fn break_route(&self, route: &str) {
        if let Ok(mut broken) = self.broken.lock() {
            broken.insert(route.to_string());
        }
    }

    /// Everything sent so far, in order
    pub fn sent(&self) -> Vec<(String, Value)> {
        self.sent.lock().map(|sent| sent.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, route: &str, payload: &Value) -> Result<(), DeliveryError> {
        let is_broken = self
            .broken
            .lock()
            .map(|broken| broken.contains(route))
            .unwrap_or(false);
        if is_broken {
            return Err(DeliveryError::StaleRoute(route.to_string()));
        }

        self.sent
            .lock()
            .map_err(|e| DeliveryError::Unavailable(e.to_string()))?
            .push((route.to_string(), payload.clone()));
        Ok(())
    }
}
