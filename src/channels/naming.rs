//! Topic naming conventions.
//!
//! Topics are colon-delimited and always lead with the entity kind, so ids
//! of different kinds never collide:
//!
//! ```text
//! agent:{agent_id}:tasks
//! agent:{agent_id}:status
//! agent:{agent_id}:heartbeat
//! workflow:{workflow_id}:updates
//! project:{project_id}:events
//! results:{task_id}
//! broadcast:system
//! coordination:requests
//! ```
//!
//! Pattern variants replace the trailing segment with `*`.
//!
//! The builders format whatever they are given. Ids from outside the
//! process should pass [`validate_id`] first: an id containing `:` or a
//! glob metacharacter can land on another entity's topic or widen a pattern.

use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Pattern matching every broadcast channel.
pub const BROADCAST_PATTERN: &str = "broadcast:*";
/// Pattern matching every system channel.
pub const SYSTEM_PATTERN: &str = "system:*";

const BROADCAST_SYSTEM: &str = "broadcast:system";
const COORDINATION_REQUESTS: &str = "coordination:requests";

// Segment separator plus everything pattern subscriptions treat specially.
const RESERVED: &[char] = &[':', '*', '?', '[', ']', '\\'];

/// Check that an id can be used as a single topic segment.
pub fn validate_id(id: &str) -> Result<()> {
    if id.trim().is_empty() {
        return Err(Error::Validation("id must not be empty".to_string()));
    }
    if let Some(c) = id.chars().find(|c| RESERVED.contains(c)) {
        return Err(Error::Validation(format!(
            "id '{}' contains reserved character '{}'",
            id, c
        )));
    }
    Ok(())
}

/// Task assignment channel for an agent.
pub fn agent_task_channel(agent_id: impl fmt::Display) -> String {
    format!("agent:{}:tasks", agent_id)
}

/// Status update channel for an agent.
pub fn agent_status_channel(agent_id: impl fmt::Display) -> String {
    format!("agent:{}:status", agent_id)
}

/// Heartbeat channel for an agent.
pub fn agent_heartbeat_channel(agent_id: impl fmt::Display) -> String {
    format!("agent:{}:heartbeat", agent_id)
}

/// Update channel for a workflow.
pub fn workflow_channel(workflow_id: impl fmt::Display) -> String {
    format!("workflow:{}:updates", workflow_id)
}

/// Event channel for a project.
pub fn project_channel(project_id: impl fmt::Display) -> String {
    format!("project:{}:events", project_id)
}

/// Result delivery channel for a task.
pub fn result_channel(task_id: impl fmt::Display) -> String {
    format!("results:{}", task_id)
}

/// System-wide announcement channel.
pub fn broadcast_channel() -> String {
    BROADCAST_SYSTEM.to_string()
}

/// Cross-agent collaboration channel.
pub fn coordination_channel() -> String {
    COORDINATION_REQUESTS.to_string()
}

/// Pattern for every channel of one agent.
pub fn agent_pattern(agent_id: impl fmt::Display) -> String {
    format!("agent:{}:*", agent_id)
}

/// Pattern for every channel of one workflow.
pub fn workflow_pattern(workflow_id: impl fmt::Display) -> String {
    format!("workflow:{}:*", workflow_id)
}

/// Pattern for every channel of one project.
pub fn project_pattern(project_id: impl fmt::Display) -> String {
    format!("project:{}:*", project_id)
}

/// Domain entity kinds that own channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Agent,
    Workflow,
    Project,
    Task,
}

/// Primary channel for an entity: agents receive tasks, workflows publish
/// updates, projects publish events, tasks deliver results.
pub fn channel_for(kind: EntityKind, id: impl fmt::Display) -> String {
    match kind {
        EntityKind::Agent => agent_task_channel(id),
        EntityKind::Workflow => workflow_channel(id),
        EntityKind::Project => project_channel(id),
        EntityKind::Task => result_channel(id),
    }
}

/// A concrete, typed channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Channel {
    AgentTasks(String),
    AgentStatus(String),
    AgentHeartbeat(String),
    WorkflowUpdates(String),
    ProjectEvents(String),
    Results(String),
    BroadcastSystem,
    CoordinationRequests,
}

impl Channel {
    /// Render the topic string.
    pub fn topic(&self) -> String {
        match self {
            Channel::AgentTasks(id) => agent_task_channel(id),
            Channel::AgentStatus(id) => agent_status_channel(id),
            Channel::AgentHeartbeat(id) => agent_heartbeat_channel(id),
            Channel::WorkflowUpdates(id) => workflow_channel(id),
            Channel::ProjectEvents(id) => project_channel(id),
            Channel::Results(id) => result_channel(id),
            Channel::BroadcastSystem => broadcast_channel(),
            Channel::CoordinationRequests => coordination_channel(),
        }
    }

    /// The entity kind and id this channel belongs to, if any.
    pub fn entity(&self) -> Option<(EntityKind, &str)> {
        match self {
            Channel::AgentTasks(id) | Channel::AgentStatus(id) | Channel::AgentHeartbeat(id) => {
                Some((EntityKind::Agent, id))
            }
            Channel::WorkflowUpdates(id) => Some((EntityKind::Workflow, id)),
            Channel::ProjectEvents(id) => Some((EntityKind::Project, id)),
            Channel::Results(id) => Some((EntityKind::Task, id)),
            Channel::BroadcastSystem | Channel::CoordinationRequests => None,
        }
    }

    /// Parse a concrete topic. Returns `None` for anything outside the grammar.
    pub fn parse(topic: &str) -> Option<Channel> {
        match topic {
            BROADCAST_SYSTEM => return Some(Channel::BroadcastSystem),
            COORDINATION_REQUESTS => return Some(Channel::CoordinationRequests),
            _ => {}
        }

        if let Some(task_id) = topic.strip_prefix("results:") {
            return segment(task_id).map(Channel::Results);
        }

        let (kind, rest) = topic.split_once(':')?;
        let (id, suffix) = rest.rsplit_once(':')?;
        let id = segment(id)?;

        match (kind, suffix) {
            ("agent", "tasks") => Some(Channel::AgentTasks(id)),
            ("agent", "status") => Some(Channel::AgentStatus(id)),
            ("agent", "heartbeat") => Some(Channel::AgentHeartbeat(id)),
            ("workflow", "updates") => Some(Channel::WorkflowUpdates(id)),
            ("project", "events") => Some(Channel::ProjectEvents(id)),
            _ => None,
        }
    }
}

fn segment(id: &str) -> Option<String> {
    validate_id(id).ok().map(|()| id.to_string())
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.topic())
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Channel::parse(s).ok_or_else(|| Error::Validation(format!("Unrecognized topic: {}", s)))
    }
}
