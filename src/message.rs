//! Message types shared by the queue, the pipeline and the router.
//!
//! A [`ReceivedMessage`] is what a [`Queue`](crate::queue::Queue) hands a
//! worker: a raw body plus the token needed to acknowledge it. The worker
//! decodes it into a [`Message`], which is what transform steps operate on.
//!
//! # Body shape
//!
//! ```json
//! {
//!   "deviceId": "D1",
//!   "value": 42
//! }
//! ```
//!
//! The `deviceId` field names the live connection the result is routed to.
//! Everything else is the payload that gets delivered.

use serde_json::Value;
use thiserror::Error;

/// Body field holding the target device identity.
pub const DEVICE_ID_FIELD: &str = "deviceId";

/// A message as received from the queue, before decoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedMessage {
    /// Queue-assigned message identifier (used in logs)
    pub id: String,

    /// Token that acknowledges (deletes) this delivery
    pub ack_token: String,

    /// Raw message body
    pub body: String,

    /// How many times the queue has handed this message out, 1 on first delivery
    pub receive_count: u32,
}

impl ReceivedMessage {
    /// Create a first-delivery message whose ack token is its id.
    pub fn new(id: impl Into<String>, body: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            ack_token: id.clone(),
            id,
            body: body.into(),
            receive_count: 1,
        }
    }

    /// Set the ack token
    pub fn with_ack_token(mut self, token: impl Into<String>) -> Self {
        self.ack_token = token.into();
        self
    }

    /// Set the receive count
    pub fn with_receive_count(mut self, count: u32) -> Self {
        self.receive_count = count;
        self
    }

    /// Decode the raw body as JSON.
    pub fn decode(&self) -> Result<Message, MessageError> {
        let body = serde_json::from_str(&self.body).map_err(|source| MessageError::Decode {
            id: self.id.clone(),
            source,
        })?;

        Ok(Message {
            id: self.id.clone(),
            body,
            receive_count: self.receive_count,
        })
    }
}

/// Errors turning a queued message into something deliverable.
#[derive(Error, Debug)]
pub enum MessageError {
    /// Body is not valid JSON
    #[error("message {id} body is not valid JSON: {source}")]
    Decode {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    /// Body carries no usable device identity after the pipeline ran
    #[error("message {id} has no string 'deviceId' field")]
    MissingDeviceId { id: String },
}

/// A decoded message flowing through the transform pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Queue-assigned message identifier
    pub id: String,

    /// Decoded JSON body
    pub body: Value,

    /// Receive count carried over from the queue
    pub receive_count: u32,
}

impl Message {
    /// Create a message from an id and body
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
            receive_count: 1,
        }
    }

    /// The target device identity, if the body carries one.
    pub fn device_id(&self) -> Option<&str> {
        self.body.get(DEVICE_ID_FIELD).and_then(Value::as_str)
    }

    /// Split the message into its device identity and the payload to deliver.
    ///
    /// The payload is the body object without the `deviceId` field.
    pub fn into_delivery(self) -> Result<(String, Value), MessageError> {
        let Value::Object(mut fields) = self.body else {
            return Err(MessageError::MissingDeviceId { id: self.id });
        };

        match fields.remove(DEVICE_ID_FIELD) {
            Some(Value::String(device_id)) => Ok((device_id, Value::Object(fields))),
            _ => Err(MessageError::MissingDeviceId { id: self.id }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_valid_body() {
        let received = ReceivedMessage::new("m-1", r#"{"deviceId":"D1","value":42}"#)
            .with_receive_count(3);

        let message = received.decode().unwrap();
        assert_eq!(message.id, "m-1");
        assert_eq!(message.receive_count, 3);
        assert_eq!(message.device_id(), Some("D1"));
        assert_eq!(message.body["value"], 42);
    }

    #[test]
    fn test_decode_malformed_body() {
        let received = ReceivedMessage::new("m-2", "{not json");

        let err = received.decode().unwrap_err();
        assert!(matches!(err, MessageError::Decode { ref id, .. } if id == "m-2"));
    }

    #[test]
    fn test_ack_token_defaults_to_id() {
        let received = ReceivedMessage::new("m-3", "{}");
        assert_eq!(received.ack_token, "m-3");

        let received = received.with_ack_token("receipt-9");
        assert_eq!(received.ack_token, "receipt-9");
        assert_eq!(received.id, "m-3");
    }

    #[test]
    fn test_into_delivery_strips_device_id() {
        let message = Message::new("m-1", json!({"deviceId": "D1", "value": 42}));

        let (device_id, payload) = message.into_delivery().unwrap();
        assert_eq!(device_id, "D1");
        assert_eq!(payload, json!({"value": 42}));
    }

    #[test]
    fn test_into_delivery_requires_string_device_id() {
        let numeric = Message::new("m-1", json!({"deviceId": 7}));
        assert!(matches!(
            numeric.into_delivery(),
            Err(MessageError::MissingDeviceId { .. })
        ));

        let missing = Message::new("m-2", json!({"value": 1}));
        assert!(missing.into_delivery().is_err());

        let not_object = Message::new("m-3", json!([1, 2, 3]));
        assert!(not_object.into_delivery().is_err());
    }
}
