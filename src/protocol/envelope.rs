//! Message envelopes: the addressed, typed unit carried over the bus.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::types::{DeliveryStatus, JsonMap, MessageContent, MessageType};
use crate::error::Result;

/// Type-tagged body of an envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagePayload {
    pub message_type: MessageType,
    pub content: JsonMap,
    #[serde(default)]
    pub metadata: JsonMap,
    /// Id of the envelope this one responds to. Only ever set by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl MessagePayload {
    /// Decode `content` into the typed variant for `message_type`.
    pub fn decode_content(&self) -> Result<MessageContent> {
        MessageContent::from_map(self.message_type, &self.content)
    }

    /// Raw access to one content field.
    pub fn content_field(&self, key: &str) -> Option<&Value> {
        self.content.get(key)
    }
}

/// Envelope wrapping a payload with routing and delivery metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageEnvelope {
    /// Unique message ID (UUID v4)
    pub id: String,
    /// Creation time
    pub timestamp: DateTime<Utc>,
    /// Sender agent ID
    pub sender_agent_id: String,
    /// Recipient agents; `None` broadcasts to every subscriber of the topic
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_agent_ids: Option<Vec<String>>,
    /// Destination topic
    pub topic: String,
    pub payload: MessagePayload,
    /// Local delivery interpretation; the broker never touches it
    #[serde(default)]
    pub delivery_status: DeliveryStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiry_at: Option<DateTime<Utc>>,
}

impl MessageEnvelope {
    pub fn message_type(&self) -> MessageType {
        self.payload.message_type
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.payload.correlation_id.as_deref()
    }

    /// Link this envelope to the request it answers.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.payload.correlation_id = Some(id.into());
        self
    }

    /// Whether this envelope answers `request`.
    pub fn correlates_with(&self, request: &MessageEnvelope) -> bool {
        self.correlation_id() == Some(request.id.as_str())
    }

    pub fn is_broadcast(&self) -> bool {
        self.recipient_agent_ids.is_none()
    }

    /// Check if this envelope is addressed to a specific agent.
    pub fn is_for(&self, agent_id: &str) -> bool {
        match &self.recipient_agent_ids {
            None => true,
            Some(ids) => ids.iter().any(|id| id == agent_id),
        }
    }

    /// Set an expiry relative to the creation time.
    pub fn expires_in(mut self, ttl: Duration) -> Self {
        self.expiry_at = Some(self.timestamp + ttl);
        self
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expiry_at.is_some_and(|expiry| now > expiry)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Decode the typed content.
    pub fn content(&self) -> Result<MessageContent> {
        self.payload.decode_content()
    }

    pub fn mark_delivered(&mut self) -> Result<()> {
        self.delivery_status = self.delivery_status.transition(DeliveryStatus::Delivered)?;
        self.delivered_at = Some(Utc::now());
        Ok(())
    }

    pub fn mark_failed(&mut self) -> Result<()> {
        self.delivery_status = self.delivery_status.transition(DeliveryStatus::Failed)?;
        Ok(())
    }

    pub fn mark_expired(&mut self) -> Result<()> {
        self.delivery_status = self.delivery_status.transition(DeliveryStatus::Expired)?;
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
