use super::{Transform, TransformError};
use crate::message::{Message, DEVICE_ID_FIELD};
use async_trait::async_trait;
use serde_json::Value;

/// Rejects messages that cannot be routed to a device.
///
/// Placing this first in the pipeline turns a malformed message into a
/// transform failure before any other step does work on it.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequireDeviceId;

#[async_trait]
impl Transform for RequireDeviceId {
    fn name(&self) -> &str {
        "require_device_id"
    }

    async fn transform(&self, message: Message) -> Result<Message, TransformError> {
        match message.body.get(DEVICE_ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => Ok(message),
            Some(Value::String(_)) => Err(TransformError::rejected("empty deviceId")),
            Some(_) => Err(TransformError::rejected("deviceId is not a string")),
            None if message.body.is_object() => Err(TransformError::rejected("missing deviceId")),
            None => Err(TransformError::rejected("body is not a JSON object")),
        }
    }
}
