//! Router - hands processed payloads to live connections.
//!
//! The [`Router`] looks the device up in the [`Directory`] and, when a route
//! is registered, sends the payload through the [`Transport`].
//!
//! # Outcomes
//!
//! ```text
//! Directory lookup      | Transport send | Delivery
//! ----------------------|----------------|---------------------
//! route found           | ok             | Delivered { route }
//! route found           | error          | Failed { route, .. }
//! absent                | -              | NoRoute
//! store unavailable     | -              | NoRoute (logged)
//! ```
//!
//! None of these is an error for the caller. "No client connected" is the
//! normal state of most devices most of the time, and a stale route will be
//! replaced when the client reconnects.
//!
//! # Example
//!
//! ```rust,ignore
//! use conduit::{Router, directory::MemoryDirectory, transport::MemoryTransport};
//! use std::sync::Arc;
//!
//! let router = Router::new(Arc::new(MemoryDirectory::new()), Arc::new(MemoryTransport::new()));
//! let delivery = router.deliver("D1", &serde_json::json!({"value": 42})).await;
//! ```

use crate::directory::Directory;
use crate::transport::Transport;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened to a payload handed to the router.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Sent to the device's registered route
    Delivered { route: String },

    /// No route registered (or the directory could not be read)
    NoRoute,

    /// A route was registered but sending over it failed
    Failed { route: String, reason: String },
}

impl Delivery {
    /// Returns true if the payload reached a route
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered { .. })
    }
}

/// Routes payloads to the live connection registered for a device.
///
/// # Thread Safety
///
/// The Router only holds shared handles and is meant to be wrapped in `Arc`
/// and shared by every worker in the process.
pub struct Router {
    directory: Arc<dyn Directory>,
    transport: Arc<dyn Transport>,
}

impl Router {
    pub fn new(directory: Arc<dyn Directory>, transport: Arc<dyn Transport>) -> Self {
        Self {
            directory,
            transport,
        }
    }

    /// Deliver `payload` to the client currently connected as `device_id`.
    pub async fn deliver(&self, device_id: &str, payload: &Value) -> Delivery {
        let route = match self.directory.get(device_id).await {
            Ok(Some(route)) => route,
            Ok(None) => {
                debug!(device_id = %device_id, "No client connected, dropping payload");
                return Delivery::NoRoute;
            }
            Err(e) => {
                warn!(
                    device_id = %device_id,
                    error = %e,
                    "Directory lookup failed, treating device as disconnected"
                );
                return Delivery::NoRoute;
            }
        };

        match self.transport.send(&route, payload).await {
            Ok(()) => {
                info!(device_id = %device_id, route = %route, "Payload delivered");
                Delivery::Delivered { route }
            }
            Err(e) => {
                warn!(
                    device_id = %device_id,
                    route = %route,
                    error = %e,
                    "Delivery failed"
                );
                Delivery::Failed {
                    route,
                    reason: e.to_string(),
                }
            }
        }
    }
}
