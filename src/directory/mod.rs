//! Reply-channel directory.
//!
//! Maps a device identity to the route handle of its currently connected
//! client. The connection layer writes entries on connect and removes them on
//! disconnect; workers only read them.
//!
//! Entries are last-write-wins: a newer [`Directory::set`] silently replaces an
//! older route, and [`Directory::delete`] on an absent identity is a no-op.
//!
//! ## Backends
//!
//! - [`RedisDirectory`]: shared across processes, optional key expiry
//! - [`MemoryDirectory`]: in-process, for tests and single-process setups

pub mod memory;
pub mod redis;

use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryDirectory;
pub use redis::RedisDirectory;

/// Errors raised by a directory backend.
#[derive(Error, Debug)]
pub enum DirectoryError {
    /// The backing store could not be reached or rejected the command
    #[error("directory store unavailable: {0}")]
    StoreUnavailable(String),
}

/// A concurrency-safe registry of device identity to route handle.
///
/// Backends must provide per-key atomicity; no multi-key transactions are
/// required.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Store `route` for `identity`, replacing any existing route.
    async fn set(&self, identity: &str, route: &str) -> Result<(), DirectoryError>;

    /// Look up the current route for `identity`.
    async fn get(&self, identity: &str) -> Result<Option<String>, DirectoryError>;

    /// Remove the route for `identity` if present.
    async fn delete(&self, identity: &str) -> Result<(), DirectoryError>;
}
