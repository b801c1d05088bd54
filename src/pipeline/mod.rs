//! Transform pipeline.
//!
//! A [`Pipeline`] is an ordered list of [`Transform`] steps. Each step takes
//! the current [`Message`] and returns a new one, or rejects it with a
//! [`TransformError`]. The first rejection stops the pipeline: later steps do
//! not run and the worker leaves the message on the queue for redelivery.
//!
//! Steps are resolved from string identifiers once, at startup, through a
//! [`TransformRegistry`]. An identifier that resolves to nothing is a startup
//! error, never a per-message one.
//!
//! ## Built-in Steps
//!
//! - `require_device_id`: [`RequireDeviceId`]
//! - `decode_body`: [`DecodeBody`]
//! - `log` / `log:<name>`: [`LogTransform`]
//! - `webhook:<name>`: [`WebhookTransform`] (configured per name)
//!
//! ## Creating Custom Steps
//!
//! ```rust,ignore
//! use conduit::pipeline::{Transform, TransformError};
//! use conduit::Message;
//! use async_trait::async_trait;
//!
//! struct Celsius;
//!
//! #[async_trait]
//! impl Transform for Celsius {
//!     fn name(&self) -> &str {
//!         "celsius"
//!     }
//!
//!     async fn transform(&self, mut message: Message) -> Result<Message, TransformError> {
//!         let f = message.body["value"].as_f64().ok_or_else(|| TransformError::rejected("no value"))?;
//!         message.body["value"] = ((f - 32.0) / 1.8).into();
//!         Ok(message)
//!     }
//! }
//! ```

pub mod decode;
pub mod device;
pub mod log;
pub mod webhook;

use crate::message::Message;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

pub use decode::DecodeBody;
pub use device::RequireDeviceId;
pub use log::LogTransform;
pub use webhook::WebhookTransform;

/// Errors a transform step can fail with.
#[derive(Error, Debug)]
pub enum TransformError {
    /// The step timed out
    #[error("transform timed out after {0}ms")]
    Timeout(u64),

    /// HTTP request failed (for webhook steps)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The step rejected the message
    #[error("message rejected: {0}")]
    Rejected(String),
}

impl TransformError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected(reason.into())
    }
}

/// A pipeline step failed.
#[derive(Error, Debug)]
#[error("pipeline step {index} ('{step}') failed: {source}")]
pub struct PipelineError {
    /// Zero-based position of the failing step
    pub index: usize,

    /// Identifier the step was configured under
    pub step: String,

    #[source]
    pub source: TransformError,
}

/// Errors resolving configured step identifiers.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown pipeline step '{0}'")]
    UnknownStep(String),
}

/// One step of the pipeline.
///
/// Steps run concurrently across workers, so any state they hold must be
/// synchronized by the step itself.
#[async_trait]
pub trait Transform: Send + Sync {
    /// Short name of the step kind (e.g. "log", "webhook")
    fn name(&self) -> &str;

    /// Transform the message or reject it.
    async fn transform(&self, message: Message) -> Result<Message, TransformError>;
}

/// An ordered list of resolved steps.
#[derive(Clone, Default)]
pub struct Pipeline {
    steps: Vec<(String, Arc<dyn Transform>)>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("steps", &self.steps.iter().map(|(id, _)| id).collect::<Vec<_>>())
            .finish()
    }
}

impl Pipeline {
    /// An empty pipeline, which passes messages through unchanged.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a step under the given identifier
    pub fn then(mut self, id: impl Into<String>, step: Arc<dyn Transform>) -> Self {
        self.steps.push((id.into(), step));
        self
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Identifiers of the steps, in execution order
    pub fn step_ids(&self) -> Vec<&str> {
        self.steps.iter().map(|(id, _)| id.as_str()).collect()
    }

    /// Run every step in order, stopping at the first failure.
    pub async fn run(&self, mut message: Message) -> Result<Message, PipelineError> {
        for (index, (id, step)) in self.steps.iter().enumerate() {
            debug!(message_id = %message.id, step = %id, index = index, "Running transform");

            message = step
                .transform(message)
                .await
                .map_err(|source| {
                    warn!(step = %id, index = index, error = %source, "Transform failed");
                    PipelineError {
                        index,
                        step: id.clone(),
                        source,
                    }
                })?;
        }
        Ok(message)
    }
}

/// Registry mapping step identifiers to transform instances.
pub struct TransformRegistry {
    transforms: BTreeMap<String, Arc<dyn Transform>>,
}

impl TransformRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            transforms: BTreeMap::new(),
        }
    }

    /// Create a registry holding the parameterless built-in steps.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("require_device_id", Arc::new(RequireDeviceId));
        registry.register("decode_body", Arc::new(DecodeBody));
        registry.register("log", Arc::new(LogTransform::new()));
        registry
    }

    /// Register a step under an identifier, replacing any previous one
    pub fn register(&mut self, id: impl Into<String>, transform: Arc<dyn Transform>) {
        self.transforms.insert(id.into(), transform);
    }

    /// Get a step by identifier
    pub fn get(&self, id: &str) -> Option<Arc<dyn Transform>> {
        self.transforms.get(id).cloned()
    }

    /// List all registered identifiers
    pub fn list(&self) -> Vec<&str> {
        self.transforms.keys().map(|s| s.as_str()).collect()
    }

    /// Resolve configured identifiers into a pipeline.
    pub fn resolve<S: AsRef<str>>(&self, ids: &[S]) -> Result<Pipeline, RegistryError> {
        ids.iter().try_fold(Pipeline::new(), |pipeline, id| {
            let id = id.as_ref();
            self.get(id)
                .map(|step| pipeline.then(id, step))
                .ok_or_else(|| RegistryError::UnknownStep(id.to_string()))
        })
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::new()
    }
}
