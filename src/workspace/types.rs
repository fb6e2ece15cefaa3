//! Workspace REST payloads.
//!
//! Only the fields the client reads are modelled; unknown fields are ignored
//! on the way in.

use serde::{Deserialize, Serialize};

/// Workspace lifecycle states as reported by the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkspaceStatus {
    Starting,
    Running,
    Stopping,
    #[default]
    Stopped,
    Snapshotting,
    Error,
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for WorkspaceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkspaceStatus::Starting => "STARTING",
            WorkspaceStatus::Running => "RUNNING",
            WorkspaceStatus::Stopping => "STOPPING",
            WorkspaceStatus::Stopped => "STOPPED",
            WorkspaceStatus::Snapshotting => "SNAPSHOTTING",
            WorkspaceStatus::Error => "ERROR",
            WorkspaceStatus::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Command {
    pub name: String,
    pub command_line: String,
    #[serde(rename = "type", default = "default_command_type")]
    pub kind: String,
}

fn default_command_type() -> String {
    "custom".to_string()
}

impl Command {
    pub fn custom(name: impl Into<String>, command_line: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command_line: command_line.into(),
            kind: default_command_type(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceConfig {
    pub name: String,
    pub default_env: String,
    pub commands: Vec<Command>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Runtime {
    pub dev_machine: Option<Machine>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Link {
    pub rel: String,
    pub href: String,
}

/// A workspace as returned by `GET /api/workspace/{key}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkspaceDescriptor {
    pub id: String,
    pub status: WorkspaceStatus,
    pub config: WorkspaceConfig,
    pub runtime: Option<Runtime>,
    pub links: Vec<Link>,
}

impl WorkspaceDescriptor {
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn link(&self, rel: &str) -> Option<&str> {
        self.links
            .iter()
            .find(|l| l.rel == rel)
            .map(|l| l.href.as_str())
    }

    pub fn ide_url(&self) -> Option<&str> {
        self.link("ide url")
    }

    /// Id of the development machine, present only while running.
    pub fn dev_machine_id(&self) -> Option<&str> {
        self.runtime
            .as_ref()
            .and_then(|r| r.dev_machine.as_ref())
            .map(|m| m.id.as_str())
    }

    /// Environment used for `start` and the machine-status topic.
    pub fn environment(&self) -> &str {
        if self.config.default_env.is_empty() {
            "default"
        } else {
            &self.config.default_env
        }
    }

    /// Command defined on the workspace under `name`.
    pub fn command(&self, name: &str) -> Option<&Command> {
        self.config.commands.iter().find(|c| c.name == name)
    }
}

/// Body of `POST /api/workspace`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateWorkspaceConfig {
    pub name: String,
    pub default_env: String,
    pub ram: u32,
    #[serde(default)]
    pub commands: Vec<Command>,
}
