//! Envelope construction.
//!
//! The factory stamps the sender and recipients into the content, checks the
//! content against the shape its message type requires, and assigns id and
//! timestamp. It never sets a correlation id on its own.

use chrono::{Duration, Utc};
use serde_json::Value;

use super::envelope::{MessageEnvelope, MessagePayload};
use super::types::{JsonMap, MessageContent, MessageType};
use crate::error::{Error, Result};

/// Parse a wire tag into a [`MessageType`].
pub fn parse_message_type(tag: &str) -> Result<MessageType> {
    tag.parse()
}

/// Build an envelope ready for publishing.
///
/// `recipient_agent_ids = None` broadcasts; `Some(&[])` addresses nobody.
pub fn create_message(
    message_type: MessageType,
    sender_agent_id: &str,
    content: JsonMap,
    topic: &str,
    recipient_agent_ids: Option<&[String]>,
    metadata: Option<JsonMap>,
) -> Result<MessageEnvelope> {
    if sender_agent_id.trim().is_empty() {
        return Err(Error::Validation("sender_agent_id must not be empty".to_string()));
    }
    if topic.trim().is_empty() {
        return Err(Error::Validation("topic must not be empty".to_string()));
    }

    let recipients = recipient_agent_ids.map(dedup_preserving_order);

    let mut merged = JsonMap::new();
    merged.insert(
        "sender_agent_id".to_string(),
        Value::String(sender_agent_id.to_string()),
    );
    merged.insert(
        "recipients".to_string(),
        Value::Array(
            recipients
                .iter()
                .flatten()
                .map(|id| Value::String(id.clone()))
                .collect(),
        ),
    );
    // Caller-supplied fields win over the stamped ones
    merged.extend(content);

    MessageContent::from_map(message_type, &merged)?;

    Ok(MessageEnvelope {
        id: uuid::Uuid::new_v4().to_string(),
        timestamp: Utc::now(),
        sender_agent_id: sender_agent_id.to_string(),
        recipient_agent_ids: recipients,
        topic: topic.to_string(),
        payload: MessagePayload {
            message_type,
            content: merged,
            metadata: metadata.unwrap_or_default(),
            correlation_id: None,
        },
        delivery_status: Default::default(),
        delivered_at: None,
        expiry_at: None,
    })
}

fn dedup_preserving_order(ids: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(id) {
            out.push(id.clone());
        }
    }
    out
}

/// Fluent builder over [`create_message`].
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    message_type: MessageType,
    sender: Option<String>,
    topic: Option<String>,
    recipients: Option<Vec<String>>,
    content: Option<Value>,
    metadata: JsonMap,
    correlation_id: Option<String>,
    ttl: Option<Duration>,
}

impl EnvelopeBuilder {
    pub fn new(message_type: MessageType) -> Self {
        Self {
            message_type,
            sender: None,
            topic: None,
            recipients: None,
            content: None,
            metadata: JsonMap::new(),
            correlation_id: None,
            ttl: None,
        }
    }

    /// Start from a wire tag; unknown tags are a validation error.
    pub fn for_tag(tag: &str) -> Result<Self> {
        Ok(Self::new(parse_message_type(tag)?))
    }

    /// Start from typed content; the message type follows the variant.
    pub fn from_content(content: impl Into<MessageContent>) -> Result<Self> {
        let content = content.into();
        let mut builder = Self::new(content.message_type());
        builder.content = Some(Value::Object(content.to_map()?));
        Ok(builder)
    }

    pub fn sender(mut self, agent_id: impl Into<String>) -> Self {
        self.sender = Some(agent_id.into());
        self
    }

    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Address explicit recipients. Without this call the envelope broadcasts.
    pub fn recipients<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.recipients = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    /// Raw content; must be a JSON object.
    pub fn content(mut self, content: Value) -> Self {
        self.content = Some(content);
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Mark the envelope as a response to the request with this id.
    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn build(self) -> Result<MessageEnvelope> {
        let sender = self
            .sender
            .ok_or_else(|| Error::Validation("sender is required".to_string()))?;
        let topic = self
            .topic
            .ok_or_else(|| Error::Validation("topic is required".to_string()))?;
        let content = match self.content {
            None => JsonMap::new(),
            Some(Value::Object(map)) => map,
            Some(other) => {
                return Err(Error::Validation(format!(
                    "content must be a JSON object, got {}",
                    other
                )))
            }
        };
        let metadata = (!self.metadata.is_empty()).then_some(self.metadata);

        let mut envelope = create_message(
            self.message_type,
            &sender,
            content,
            &topic,
            self.recipients.as_deref(),
            metadata,
        )?;

        envelope.payload.correlation_id = self.correlation_id;
        if let Some(ttl) = self.ttl {
            envelope = envelope.expires_in(ttl);
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::types::{Heartbeat, ResultDelivery, ResultStatus};
    use serde_json::json;

    fn object(value: Value) -> JsonMap {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_create_merges_sender_and_recipients() {
        let recipients = vec!["B".to_string(), "C".to_string(), "B".to_string()];
        let envelope = create_message(
            MessageType::Custom,
            "A",
            object(json!({"note": "hi"})),
            "coordination:requests",
            Some(recipients.as_slice()),
            None,
        )
        .unwrap();

        assert_eq!(envelope.payload.content["sender_agent_id"], json!("A"));
        assert_eq!(envelope.payload.content["recipients"], json!(["B", "C"]));
        assert_eq!(envelope.payload.content["note"], json!("hi"));
        assert_eq!(envelope.recipient_agent_ids, Some(vec!["B".to_string(), "C".to_string()]));
        assert_eq!(envelope.payload.correlation_id, None);
    }

    #[test]
    fn test_broadcast_stamps_empty_recipient_list() {
        let envelope = create_message(
            MessageType::Custom,
            "A",
            JsonMap::new(),
            "broadcast:system",
            None,
            None,
        )
        .unwrap();
        assert!(envelope.is_broadcast());
        assert_eq!(envelope.payload.content["recipients"], json!([]));
    }

    #[test]
    fn test_caller_fields_override_stamps() {
        let envelope = create_message(
            MessageType::Custom,
            "A",
            object(json!({"sender_agent_id": "proxy"})),
            "broadcast:system",
            None,
            None,
        )
        .unwrap();
        assert_eq!(envelope.payload.content["sender_agent_id"], json!("proxy"));
        assert_eq!(envelope.sender_agent_id, "A");
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(matches!(EnvelopeBuilder::for_tag("gossip"), Err(Error::Validation(_))));
        assert!(EnvelopeBuilder::for_tag("heartbeat").is_ok());
    }

    #[test]
    fn test_content_shape_validated() {
        let err = EnvelopeBuilder::new(MessageType::ResultDelivery)
            .sender("A")
            .topic("results:t1")
            .content(json!({"task_id": "t1"}))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_missing_sender_or_topic() {
        assert!(EnvelopeBuilder::new(MessageType::Custom).topic("t").build().is_err());
        assert!(EnvelopeBuilder::new(MessageType::Custom).sender("A").build().is_err());
        assert!(create_message(MessageType::Custom, " ", JsonMap::new(), "t", None, None).is_err());
    }

    #[test]
    fn test_non_object_content_rejected() {
        let result = EnvelopeBuilder::new(MessageType::Custom)
            .sender("A")
            .topic("broadcast:system")
            .content(json!([1, 2]))
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn test_from_typed_content() {
        let envelope = EnvelopeBuilder::from_content(ResultDelivery {
            task_id: "t1".into(),
            status: ResultStatus::Completed,
            output_artifacts: JsonMap::new(),
            error_message: None,
            execution_time_seconds: Some(1.5),
        })
        .unwrap()
        .sender("worker-1")
        .topic("results:t1")
        .correlation_id("request-1")
        .metadata("attempt", 1)
        .build()
        .unwrap();

        assert_eq!(envelope.message_type(), MessageType::ResultDelivery);
        assert_eq!(envelope.correlation_id(), Some("request-1"));
        assert_eq!(envelope.payload.metadata["attempt"], json!(1));
        match envelope.content().unwrap() {
            MessageContent::ResultDelivery(result) => assert_eq!(result.status, ResultStatus::Completed),
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn test_ids_are_unique() {
        let build = || {
            EnvelopeBuilder::from_content(Heartbeat {
                agent_id: None,
                agent_state: "idle".into(),
                active_tasks_count: 0,
                memory_mb: None,
                cpu_percent: None,
            })
            .unwrap()
            .sender("A")
            .topic("agent:A:heartbeat")
            .build()
            .unwrap()
        };
        let ids: std::collections::HashSet<String> = (0..100).map(|_| build().id).collect();
        assert_eq!(ids.len(), 100);
    }

    #[test]
    fn test_builder_expiry() {
        let envelope = EnvelopeBuilder::new(MessageType::Custom)
            .sender("A")
            .topic("broadcast:system")
            .expires_in(Duration::seconds(5))
            .build()
            .unwrap();
        assert_eq!(envelope.expiry_at, Some(envelope.timestamp + Duration::seconds(5)));
    }
}
