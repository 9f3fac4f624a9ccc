//! Maps domain events to topics so producers never spell topic strings.

use std::fmt::Display;

use super::naming;

/// Topic routing for domain events.
pub struct TopicRouter;

impl TopicRouter {
    /// Topic for assigning a task to an agent.
    pub fn route_task_assignment(agent_id: impl Display) -> String {
        naming::agent_task_channel(agent_id)
    }

    /// Topic for an agent's status updates.
    pub fn route_status_update(agent_id: impl Display) -> String {
        naming::agent_status_channel(agent_id)
    }

    /// Topic for an agent's liveness pings.
    pub fn route_heartbeat(agent_id: impl Display) -> String {
        naming::agent_heartbeat_channel(agent_id)
    }

    /// Topic for workflow lifecycle events.
    pub fn route_workflow_update(workflow_id: impl Display) -> String {
        naming::workflow_channel(workflow_id)
    }

    /// Topic for delivering a task's result.
    pub fn route_result_delivery(task_id: impl Display) -> String {
        naming::result_channel(task_id)
    }

    /// Topic for coordination scoped to one project.
    pub fn route_coordination_request(project_id: impl Display) -> String {
        naming::project_channel(project_id)
    }

    /// Topic for open collaboration requests any agent may answer.
    pub fn route_collaboration_request() -> String {
        naming::coordination_channel()
    }

    /// Topic for system-wide announcements.
    pub fn route_system_event() -> String {
        naming::broadcast_channel()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes() {
        assert_eq!(TopicRouter::route_task_assignment("a"), "agent:a:tasks");
        assert_eq!(TopicRouter::route_status_update("a"), "agent:a:status");
        assert_eq!(TopicRouter::route_heartbeat("a"), "agent:a:heartbeat");
        assert_eq!(TopicRouter::route_workflow_update("w"), "workflow:w:updates");
        assert_eq!(TopicRouter::route_result_delivery("t"), "results:t");
        assert_eq!(TopicRouter::route_coordination_request("p"), "project:p:events");
        assert_eq!(TopicRouter::route_collaboration_request(), "coordination:requests");
        assert_eq!(TopicRouter::route_system_event(), "broadcast:system");
    }
}
