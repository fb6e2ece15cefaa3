//! Channel names used by the workspace server.

use uuid::Uuid;

/// Workspace lifecycle events.
pub fn workspace(workspace_id: &str) -> String {
    format!("workspace:{workspace_id}")
}

/// Machine status events for one environment of a workspace.
pub fn machine_status(workspace_id: &str, environment: &str) -> String {
    format!("machine:status:{workspace_id}:{environment}")
}

pub fn process_output(id: &str) -> String {
    format!("process:output:{id}")
}

/// A fresh, unique output channel for one command execution.
pub fn new_process_channel() -> String {
    process_output(&Uuid::new_v4().to_string())
}
