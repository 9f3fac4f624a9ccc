//! Agent messaging protocol.
//!
//! - Closed set of message types with typed content per type
//! - Envelopes carrying sender, recipients, topic and correlation id
//! - A factory that stamps and validates envelopes before they hit the bus

pub mod envelope;
pub mod factory;
pub mod types;

pub use envelope::{MessageEnvelope, MessagePayload};
pub use factory::{create_message, parse_message_type, EnvelopeBuilder};
pub use types::{
    CapabilityQuery, CapabilityResponse, CollaborationRequest, DeliveryStatus, ErrorReport,
    Heartbeat, JsonMap, MessageContent, MessageType, ResultDelivery, ResultStatus, Severity,
    SourceType, StatusUpdate, TaskAssignment, WorkflowDirective,
};
