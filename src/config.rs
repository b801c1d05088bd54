//! Configuration module for Conduit.
//!
//! Loads configuration from TOML files with environment variable substitution.
//!
//! # Example
//!
//! ```toml
//! [queue]
//! url = "${REDIS_URL}"
//! name = "conduit:messages"
//! max_receives = 5
//!
//! [worker]
//! threads = 4
//!
//! [pipeline]
//! steps = ["require_device_id", "log:audit", "webhook:archive"]
//!
//! [transforms.log.audit]
//! prefix = "audit"
//!
//! [transforms.webhook.archive]
//! url = "${ARCHIVE_WEBHOOK_URL}"
//! ```

use crate::pipeline::{
    LogTransform, Pipeline, RegistryError, TransformRegistry, WebhookTransform,
};
use crate::worker::PollSettings;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Config file used when neither `--config` nor `CONDUIT_CONFIG` is given
pub const DEFAULT_CONFIG_PATH: &str = "config/conduit.toml";

/// Largest batch a single receive may ask for
const MAX_BATCH_SIZE: usize = 10;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConduitConfig {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub directory: DirectoryConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Named, parameterized transform steps
    #[serde(default)]
    pub transforms: TransformsConfig,
}

/// Work queue configuration
#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_queue_name")]
    pub name: String,

    #[serde(default = "default_consumer_group")]
    pub consumer_group: String,

    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Dead-letter a failing message once it was received this many times
    #[serde(default)]
    pub max_receives: Option<u32>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            name: default_queue_name(),
            consumer_group: default_consumer_group(),
            wait_time_secs: default_wait_time_secs(),
            batch_size: default_batch_size(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_receives: None,
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_queue_name() -> String {
    crate::DEFAULT_QUEUE_NAME.to_string()
}

fn default_consumer_group() -> String {
    crate::DEFAULT_CONSUMER_GROUP.to_string()
}

fn default_wait_time_secs() -> u64 {
    20
}

fn default_batch_size() -> usize {
    MAX_BATCH_SIZE
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

/// Reply-channel directory configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DirectoryConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Expire routes that are not refreshed within this many seconds
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
            ttl_secs: None,
        }
    }
}

fn default_key_prefix() -> String {
    crate::directory::redis::DEFAULT_KEY_PREFIX.to_string()
}

/// Worker configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WorkerConfig {
    /// Execution contexts; more than one runs a worker group
    #[serde(default = "default_threads")]
    pub threads: usize,

    #[serde(default)]
    pub name: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            name: None,
        }
    }
}

fn default_threads() -> usize {
    1
}

/// Ordered transform step identifiers
#[derive(Debug, Deserialize, Clone, Default)]
pub struct PipelineConfig {
    #[serde(default)]
    pub steps: Vec<String>,
}

/// Named transform configurations
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TransformsConfig {
    #[serde(default)]
    pub log: HashMap<String, LogTransformConfig>,

    #[serde(default)]
    pub webhook: HashMap<String, WebhookTransformConfig>,
}

/// Log transform configuration
#[derive(Debug, Deserialize, Clone)]
pub struct LogTransformConfig {
    #[serde(default = "default_log_prefix")]
    pub prefix: String,
}

fn default_log_prefix() -> String {
    "conduit".to_string()
}

/// Webhook transform configuration
#[derive(Debug, Deserialize, Clone)]
pub struct WebhookTransformConfig {
    pub url: String,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_retries")]
    pub retries: u32,
}

fn default_timeout_ms() -> u64 {
    10000
}

fn default_retries() -> u32 {
    2
}

impl ConduitConfig {
    /// Build the transform registry: built-ins plus every configured
    /// `log:<name>` and `webhook:<name>` step.
    pub fn build_registry(&self) -> TransformRegistry {
        let mut registry = TransformRegistry::with_builtins();

        for (name, config) in &self.transforms.log {
            registry.register(
                format!("log:{name}"),
                Arc::new(LogTransform::with_prefix(&config.prefix)),
            );
        }

        for (name, config) in &self.transforms.webhook {
            // Skip webhooks with unsubstituted env vars
            if config.url.contains("${") {
                warn!(
                    webhook = %name,
                    "Skipping webhook with unsubstituted URL: {}",
                    config.url
                );
                continue;
            }

            let transform = WebhookTransform::new(&config.url)
                .with_timeout(Duration::from_millis(config.timeout_ms))
                .with_retries(config.retries);
            registry.register(format!("webhook:{name}"), Arc::new(transform));
        }

        registry
    }

    /// Resolve `[pipeline] steps` into a pipeline.
    ///
    /// Fails on the first identifier with no registered step, or on a step
    /// naming a webhook whose URL still holds an unset `${VAR}`.
    pub fn build_pipeline(&self) -> Result<Pipeline, ConfigError> {
        for step in &self.pipeline.steps {
            let Some(webhook) = step
                .strip_prefix("webhook:")
                .and_then(|name| self.transforms.webhook.get(name))
            else {
                continue;
            };
            if let Some(caps) = env_var_pattern().captures(&webhook.url) {
                return Err(ConfigError::ValidationError(format!(
                    "Pipeline step '{}' uses a webhook URL with unset environment variable {}",
                    step, &caps[1]
                )));
            }
        }

        let registry = self.build_registry();
        let pipeline = registry.resolve(&self.pipeline.steps)?;

        info!(
            steps = ?pipeline.step_ids(),
            available = ?registry.list(),
            "Pipeline configured"
        );
        Ok(pipeline)
    }

    /// Worker polling parameters from `[queue]`.
    pub fn poll_settings(&self) -> PollSettings {
        PollSettings {
            wait_time: Duration::from_secs(self.queue.wait_time_secs),
            batch_size: self.queue.batch_size,
            visibility_timeout: Duration::from_secs(self.queue.visibility_timeout_secs),
            max_receives: self.queue.max_receives,
            ..PollSettings::default()
        }
    }

    /// Load configuration from the default path or CONDUIT_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("CONDUIT_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let content = substitute_env_vars(&content);

        debug!("Parsing TOML configuration");
        let config: ConduitConfig = toml::from_str(&content)?;

        config.validate()?;

        info!(
            queue = %config.queue.name,
            threads = config.worker.threads,
            steps = config.pipeline.steps.len(),
            webhook_transforms = config.transforms.webhook.len(),
            log_transforms = config.transforms.log.len(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "Queue name must not be empty".to_string(),
            ));
        }

        if self.queue.batch_size == 0 || self.queue.batch_size > MAX_BATCH_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "Queue batch_size must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.queue.batch_size
            )));
        }

        if self.queue.visibility_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "Queue visibility_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.queue.max_receives == Some(0) {
            return Err(ConfigError::ValidationError(
                "Queue max_receives must be at least 1".to_string(),
            ));
        }

        if self.worker.threads == 0 {
            return Err(ConfigError::ValidationError(
                "Worker threads must be at least 1".to_string(),
            ));
        }

        // Validate webhook URLs
        for (name, webhook) in &self.transforms.webhook {
            if webhook.url.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "Webhook '{}' has empty URL",
                    name
                )));
            }

            // Check for unsubstituted env vars
            if webhook.url.contains("${") {
                warn!(
                    webhook = %name,
                    url = %webhook.url,
                    "Webhook URL contains unsubstituted environment variable"
                );
                continue;
            }

            // Validate URL format
            if !webhook.url.starts_with("http://") && !webhook.url.starts_with("https://") {
                return Err(ConfigError::ValidationError(format!(
                    "Webhook '{}' URL must start with http:// or https://",
                    name
                )));
            }
        }

        Ok(())
    }
}

/// Matches `${VAR_NAME}`, capturing the name
fn env_var_pattern() -> &'static Regex {
    static ENV_VAR: OnceLock<Regex> = OnceLock::new();
    ENV_VAR.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
    })
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    env_var_pattern().replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                caps[0].to_string()
            }
        }
    })
    .to_string()
}
