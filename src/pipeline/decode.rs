use super::{Transform, TransformError};
use crate::message::Message;
use async_trait::async_trait;
use serde_json::Value;

/// Unwraps double-encoded bodies.
///
/// Some producers send the JSON document as a JSON string
/// (`"{\"deviceId\":\"D1\"}"`). This step parses such a string in place and
/// leaves any other body untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct DecodeBody;

#[async_trait]
impl Transform for DecodeBody {
    fn name(&self) -> &str {
        "decode_body"
    }

    async fn transform(&self, mut message: Message) -> Result<Message, TransformError> {
        if let Value::String(raw) = &message.body {
            message.body = serde_json::from_str(raw)?;
        }
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_decodes_embedded_json() {
        let message = Message::new("m-1", json!("{\"deviceId\":\"D1\",\"value\":42}"));

        let decoded = DecodeBody.transform(message).await.unwrap();
        assert_eq!(decoded.body, json!({"deviceId": "D1", "value": 42}));
    }

    #[tokio::test]
    async fn test_passes_objects_through() {
        let message = Message::new("m-1", json!({"deviceId": "D1"}));

        let decoded = DecodeBody.transform(message.clone()).await.unwrap();
        assert_eq!(decoded, message);
    }

    #[tokio::test]
    async fn test_rejects_invalid_embedded_json() {
        let message = Message::new("m-1", json!("not json"));

        let err = DecodeBody.transform(message).await.unwrap_err();
        assert!(matches!(err, TransformError::Serialization(_)));
    }
}
