//! Channel naming, topic routing, and local subscription bookkeeping.

pub mod naming;
pub mod registry;
pub mod router;

pub use naming::{
    agent_heartbeat_channel, agent_pattern, agent_status_channel, agent_task_channel,
    broadcast_channel, channel_for, coordination_channel, project_channel, project_pattern,
    result_channel, validate_id, workflow_channel, workflow_pattern, Channel, EntityKind, BROADCAST_PATTERN,
    SYSTEM_PATTERN,
};
pub use registry::SubscriptionRegistry;
pub use router::TopicRouter;
