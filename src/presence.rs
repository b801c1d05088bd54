//! Connection-layer side of the directory.
//!
//! The process that accepts websocket connections calls
//! [`Presence::connect`] once a client is identified and
//! [`Presence::disconnect`] when its socket closes. It is the only writer of
//! directory entries.

use crate::directory::{Directory, DirectoryError};
use std::sync::Arc;
use tracing::{info, warn};

/// Registers and removes the routes of connected devices.
#[derive(Clone)]
pub struct Presence {
    directory: Arc<dyn Directory>,
}

impl Presence {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    /// Record that `device_id` is now reachable through `route`.
    ///
    /// Fails when the directory is unreachable; the caller should refuse the
    /// connection, since results could not be routed to it.
    pub async fn connect(&self, device_id: &str, route: &str) -> Result<(), DirectoryError> {
        self.directory.set(device_id, route).await?;
        info!(device_id = %device_id, route = %route, "Device connected");
        Ok(())
    }

    /// Forget the route of `device_id`.
    ///
    /// Never fails: an unreachable directory is logged and the entry is left
    /// to expire.
    pub async fn disconnect(&self, device_id: &str) {
        match self.directory.delete(device_id).await {
            Ok(()) => info!(device_id = %device_id, "Device disconnected"),
            Err(e) => warn!(
                device_id = %device_id,
                error = %e,
                "Failed to remove route on disconnect"
            ),
        }
    }
}
