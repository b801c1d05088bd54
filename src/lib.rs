//! # Conduit
//!
//! Queue-driven message workers that deliver results to live client
//! connections.
//!
//! ## Architecture
//!
//! ```text
//! Queue -> Worker -> Pipeline -> Router -> Directory lookup -> Transport -> Client
//!                                              ^
//!                         Presence (connect / disconnect)
//! ```
//!
//! A worker long-polls the [`queue`], runs each message through the transform
//! [`pipeline`], and hands the result to the [`router`], which looks up the
//! device's current route in the [`directory`] and sends over the
//! [`transport`]. Messages are acknowledged once the pipeline succeeded,
//! whether or not a client was connected.
//!
//! ## Modules
//!
//! - [`message`]: Queue message types and the `deviceId` convention
//! - [`queue`]: Visibility-timeout queue trait and backends
//! - [`pipeline`]: Transform steps, pipeline and step registry
//! - [`directory`]: Device identity to route handle mapping
//! - [`presence`]: Connection-layer writer of directory entries
//! - [`transport`]: Sending payloads to route handles
//! - [`router`]: Directory lookup plus transport send
//! - [`worker`]: The queue-consuming worker loop
//! - [`group`]: Several workers in one process
//! - [`hooks`]: Lifecycle notifications
//! - [`dlq`]: Dead letters for poison messages
//! - [`shutdown`]: Termination flag driven by OS signals
//! - [`config`]: TOML configuration

pub mod config;
pub mod directory;
pub mod dlq;
pub mod group;
pub mod hooks;
pub mod message;
pub mod pipeline;
pub mod presence;
pub mod queue;
pub mod router;
pub mod shutdown;
pub mod transport;
pub mod worker;

// Re-export commonly used types at crate root
pub use directory::Directory;
pub use group::WorkerGroup;
pub use hooks::{Hooks, LifecycleHook};
pub use message::{Message, ReceivedMessage};
pub use pipeline::{Pipeline, Transform, TransformError, TransformRegistry};
pub use presence::Presence;
pub use queue::Queue;
pub use router::{Delivery, Router};
pub use shutdown::ShutdownSignal;
pub use worker::{Runnable, Worker, WorkerContext, WorkerExit};

/// Default queue (Redis stream) name
pub const DEFAULT_QUEUE_NAME: &str = "conduit:messages";

/// Default consumer group name
pub const DEFAULT_CONSUMER_GROUP: &str = "conduit_workers";
