//! Message types and typed content for the agent messaging protocol.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Open key/value object used for content, metadata and artifacts.
pub type JsonMap = Map<String, Value>;

/// Message type classification. The set is closed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskAssignment,
    StatusUpdate,
    CollaborationRequest,
    Heartbeat,
    ErrorReport,
    ResultDelivery,
    CapabilityQuery,
    CapabilityResponse,
    WorkflowDirective,
    Custom,
}

impl MessageType {
    pub const ALL: [MessageType; 10] = [
        MessageType::TaskAssignment,
        MessageType::StatusUpdate,
        MessageType::CollaborationRequest,
        MessageType::Heartbeat,
        MessageType::ErrorReport,
        MessageType::ResultDelivery,
        MessageType::CapabilityQuery,
        MessageType::CapabilityResponse,
        MessageType::WorkflowDirective,
        MessageType::Custom,
    ];

    /// The wire tag.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::TaskAssignment => "task_assignment",
            MessageType::StatusUpdate => "status_update",
            MessageType::CollaborationRequest => "collaboration_request",
            MessageType::Heartbeat => "heartbeat",
            MessageType::ErrorReport => "error_report",
            MessageType::ResultDelivery => "result_delivery",
            MessageType::CapabilityQuery => "capability_query",
            MessageType::CapabilityResponse => "capability_response",
            MessageType::WorkflowDirective => "workflow_directive",
            MessageType::Custom => "custom",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        MessageType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("Unknown message type: {}", s)))
    }
}

/// Delivery state as interpreted locally by a producer or consumer.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Delivered,
    Failed,
    Expired,
}

impl DeliveryStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }

    /// Move to `next`. Only `pending` may move; terminal states are final.
    pub fn transition(self, next: DeliveryStatus) -> Result<DeliveryStatus> {
        if self.is_terminal() {
            return Err(Error::Validation(format!(
                "Delivery status {:?} is terminal, cannot become {:?}",
                self, next
            )));
        }
        Ok(next)
    }
}

/// Whether a status update describes an agent or a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Agent,
    Task,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    #[default]
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Completed,
    Failed,
}

/// Assign a task to an agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskAssignment {
    pub task_id: String,
    pub task_name: String,
    pub description: String,
    #[serde(default)]
    pub required_capabilities: Vec<String>,
    #[serde(default)]
    pub input_artifacts: JsonMap,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

/// Agent or task state change.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusUpdate {
    pub source_id: String,
    pub source_type: SourceType,
    pub current_state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_percent: Option<u8>,
    #[serde(default)]
    pub details: JsonMap,
}

/// Ask other agents for help with a capability.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollaborationRequest {
    pub requesting_agent_id: String,
    pub capability_needed: String,
    #[serde(default)]
    pub context: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_by: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reward_or_incentive: Option<String>,
}

/// Liveness ping with resource usage.
///
/// `agent_id` may be omitted; the sender id stamped by the factory
/// identifies the agent in that case.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub agent_state: String,
    #[serde(default)]
    pub active_tasks_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorReport {
    pub source_id: String,
    pub error_type: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(default)]
    pub context: JsonMap,
    #[serde(default)]
    pub severity: Severity,
}

/// Outcome of a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResultDelivery {
    pub task_id: String,
    pub status: ResultStatus,
    #[serde(default)]
    pub output_artifacts: JsonMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_seconds: Option<f64>,
}

/// `query_type` is `search`, `all`, or a specific capability name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityQuery {
    pub query_type: String,
    #[serde(default)]
    pub filters: JsonMap,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CapabilityResponse {
    pub capabilities: Vec<String>,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_correlation_id: Option<String>,
}

/// Instruction issued to the participants of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowDirective {
    pub workflow_id: String,
    pub directive: String,
    #[serde(default)]
    pub parameters: JsonMap,
}

/// Typed content, one variant per [`MessageType`].
#[derive(Debug, Clone, PartialEq)]
pub enum MessageContent {
    TaskAssignment(TaskAssignment),
    StatusUpdate(StatusUpdate),
    CollaborationRequest(CollaborationRequest),
    Heartbeat(Heartbeat),
    ErrorReport(ErrorReport),
    ResultDelivery(ResultDelivery),
    CapabilityQuery(CapabilityQuery),
    CapabilityResponse(CapabilityResponse),
    WorkflowDirective(WorkflowDirective),
    Custom(JsonMap),
}

impl MessageContent {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageContent::TaskAssignment(_) => MessageType::TaskAssignment,
            MessageContent::StatusUpdate(_) => MessageType::StatusUpdate,
            MessageContent::CollaborationRequest(_) => MessageType::CollaborationRequest,
            MessageContent::Heartbeat(_) => MessageType::Heartbeat,
            MessageContent::ErrorReport(_) => MessageType::ErrorReport,
            MessageContent::ResultDelivery(_) => MessageType::ResultDelivery,
            MessageContent::CapabilityQuery(_) => MessageType::CapabilityQuery,
            MessageContent::CapabilityResponse(_) => MessageType::CapabilityResponse,
            MessageContent::WorkflowDirective(_) => MessageType::WorkflowDirective,
            MessageContent::Custom(_) => MessageType::Custom,
        }
    }

    /// Serialize into a JSON object.
    pub fn to_map(&self) -> Result<JsonMap> {
        let value = match self {
            MessageContent::TaskAssignment(c) => serde_json::to_value(c)?,
            MessageContent::StatusUpdate(c) => serde_json::to_value(c)?,
            MessageContent::CollaborationRequest(c) => serde_json::to_value(c)?,
            MessageContent::Heartbeat(c) => serde_json::to_value(c)?,
            MessageContent::ErrorReport(c) => serde_json::to_value(c)?,
            MessageContent::ResultDelivery(c) => serde_json::to_value(c)?,
            MessageContent::CapabilityQuery(c) => serde_json::to_value(c)?,
            MessageContent::CapabilityResponse(c) => serde_json::to_value(c)?,
            MessageContent::WorkflowDirective(c) => serde_json::to_value(c)?,
            MessageContent::Custom(map) => return Ok(map.clone()),
        };
        match value {
            Value::Object(map) => Ok(map),
            other => Err(Error::Validation(format!(
                "{} content must serialize to an object, got {}",
                self.message_type(),
                other
            ))),
        }
    }

    /// Interpret a content object according to its message type.
    ///
    /// Unknown extra fields (such as the stamped `sender_agent_id`) are ignored.
    pub fn from_map(message_type: MessageType, content: &JsonMap) -> Result<Self> {
        let value = Value::Object(content.clone());
        let decoded = match message_type {
            MessageType::TaskAssignment => serde_json::from_value(value).map(MessageContent::TaskAssignment),
            MessageType::StatusUpdate => serde_json::from_value(value).map(MessageContent::StatusUpdate),
            MessageType::CollaborationRequest => {
                serde_json::from_value(value).map(MessageContent::CollaborationRequest)
            }
            MessageType::Heartbeat => serde_json::from_value(value).map(MessageContent::Heartbeat),
            MessageType::ErrorReport => serde_json::from_value(value).map(MessageContent::ErrorReport),
            MessageType::ResultDelivery => serde_json::from_value(value).map(MessageContent::ResultDelivery),
            MessageType::CapabilityQuery => serde_json::from_value(value).map(MessageContent::CapabilityQuery),
            MessageType::CapabilityResponse => {
                serde_json::from_value(value).map(MessageContent::CapabilityResponse)
            }
            MessageType::WorkflowDirective => {
                serde_json::from_value(value).map(MessageContent::WorkflowDirective)
            }
            MessageType::Custom => return Ok(MessageContent::Custom(content.clone())),
        };
        decoded.map_err(|e| Error::Validation(format!("Invalid {} content: {}", message_type, e)))
    }
}

macro_rules! impl_from_content {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for MessageContent {
                fn from(content: $variant) -> Self {
                    MessageContent::$variant(content)
                }
            }
        )*
    };
}

impl_from_content!(
    TaskAssignment,
    StatusUpdate,
    CollaborationRequest,
    Heartbeat,
    ErrorReport,
    ResultDelivery,
    CapabilityQuery,
    CapabilityResponse,
    WorkflowDirective,
);

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_message_type_tags() {
        for t in MessageType::ALL {
            let json = serde_json::to_value(t).unwrap();
            assert_eq!(json, Value::String(t.as_str().to_string()));
            assert_eq!(t.as_str().parse::<MessageType>().unwrap(), t);
        }
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let err = "gossip".parse::<MessageType>().unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(serde_json::from_str::<MessageType>("\"gossip\"").is_err());
    }

    #[test]
    fn test_delivery_status_transitions() {
        let status = DeliveryStatus::default();
        assert_eq!(status, DeliveryStatus::Pending);
        assert_eq!(status.transition(DeliveryStatus::Pending).unwrap(), DeliveryStatus::Pending);

        for terminal in [DeliveryStatus::Delivered, DeliveryStatus::Failed, DeliveryStatus::Expired] {
            let reached = DeliveryStatus::Pending.transition(terminal).unwrap();
            assert!(reached.is_terminal());
            assert!(reached.transition(DeliveryStatus::Pending).is_err());
            assert!(reached.transition(DeliveryStatus::Delivered).is_err());
        }
    }

    #[test]
    fn test_heartbeat_from_minimal_map() {
        let map = json!({"agent_state": "idle", "active_tasks_count": 0, "sender_agent_id": "A"});
        let content = MessageContent::from_map(MessageType::Heartbeat, map.as_object().unwrap()).unwrap();
        match content {
            MessageContent::Heartbeat(hb) => {
                assert_eq!(hb.agent_state, "idle");
                assert_eq!(hb.agent_id, None);
            }
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[test]
    fn test_wrong_shape_rejected() {
        let map = json!({"agent_state": "idle"});
        let err = MessageContent::from_map(MessageType::TaskAssignment, map.as_object().unwrap()).unwrap_err();
        assert!(err.to_string().contains("task_assignment"));
    }

    #[test]
    fn test_custom_accepts_anything() {
        let map = json!({"anything": [1, 2, 3]});
        let content = MessageContent::from_map(MessageType::Custom, map.as_object().unwrap()).unwrap();
        assert_eq!(content.message_type(), MessageType::Custom);
        assert_eq!(content.to_map().unwrap(), *map.as_object().unwrap());
    }

    #[test]
    fn test_task_assignment_defaults() {
        let map = json!({"task_id": "t1", "task_name": "build", "description": "compile it"});
        let content = MessageContent::from_map(MessageType::TaskAssignment, map.as_object().unwrap()).unwrap();
        let MessageContent::TaskAssignment(task) = content else {
            panic!("expected a task assignment");
        };
        assert!(task.required_capabilities.is_empty());
        assert!(task.dependencies.is_empty());
        assert_eq!(task.priority, 0);
    }

    #[test]
    fn test_error_report_severity_default() {
        let content: MessageContent = ErrorReport {
            source_id: "a".into(),
            error_type: "Timeout".into(),
            error_message: "no reply".into(),
            stack_trace: None,
            context: JsonMap::new(),
            severity: Severity::default(),
        }
        .into();
        let map = content.to_map().unwrap();
        assert_eq!(map["severity"], json!("error"));
    }
}
