//! Workspace REST collaborator.
//!
//! [`WorkspaceApi`] is an enum over backends, dispatched by `match` in the
//! same way as [`crate::transport::Transport`]. `Http` talks to a real
//! server; `Memory` keeps state in-process for tests.

pub mod http;
pub mod memory;

use crate::error::AppError;
use crate::workspace::types::{Command, CreateWorkspaceConfig, WorkspaceDescriptor};

pub use http::HttpWorkspaceApi;
pub use memory::{MemoryWorkspaceApi, Mutation};

#[derive(Debug, Clone)]
pub enum WorkspaceApi {
    Http(HttpWorkspaceApi),
    Memory(MemoryWorkspaceApi),
}

impl WorkspaceApi {
    /// `true` once `GET /api/workspace` answers 2xx.
    pub async fn ping(&self) -> Result<bool, AppError> {
        match self {
            WorkspaceApi::Http(api) => api.ping().await,
            WorkspaceApi::Memory(api) => api.ping().await,
        }
    }

    pub async fn list(&self) -> Result<Vec<WorkspaceDescriptor>, AppError> {
        match self {
            WorkspaceApi::Http(api) => api.list().await,
            WorkspaceApi::Memory(api) => api.list().await,
        }
    }

    /// Fetch by id, or by name with a `:<name>` key.
    pub async fn get(&self, key: &str) -> Result<WorkspaceDescriptor, AppError> {
        match self {
            WorkspaceApi::Http(api) => api.get(key).await,
            WorkspaceApi::Memory(api) => api.get(key).await,
        }
    }

    pub async fn create(&self, config: &CreateWorkspaceConfig) -> Result<WorkspaceDescriptor, AppError> {
        match self {
            WorkspaceApi::Http(api) => api.create(config).await,
            WorkspaceApi::Memory(api) => api.create(config).await,
        }
    }

    pub async fn start(&self, id: &str, environment: &str) -> Result<(), AppError> {
        match self {
            WorkspaceApi::Http(api) => api.start(id, environment).await,
            WorkspaceApi::Memory(api) => api.start(id, environment).await,
        }
    }

    pub async fn stop(&self, id: &str) -> Result<(), AppError> {
        match self {
            WorkspaceApi::Http(api) => api.stop(id).await,
            WorkspaceApi::Memory(api) => api.stop(id).await,
        }
    }

    pub async fn delete(&self, id: &str) -> Result<(), AppError> {
        match self {
            WorkspaceApi::Http(api) => api.delete(id).await,
            WorkspaceApi::Memory(api) => api.delete(id).await,
        }
    }

    pub async fn execute_command(
        &self,
        id: &str,
        machine_id: &str,
        command: &Command,
        output_channel: &str,
    ) -> Result<(), AppError> {
        match self {
            WorkspaceApi::Http(api) => {
                api.execute_command(id, machine_id, command, output_channel).await
            }
            WorkspaceApi::Memory(api) => {
                api.execute_command(id, machine_id, command, output_channel).await
            }
        }
    }
}

impl From<HttpWorkspaceApi> for WorkspaceApi {
    fn from(api: HttpWorkspaceApi) -> Self {
        WorkspaceApi::Http(api)
    }
}

impl From<MemoryWorkspaceApi> for WorkspaceApi {
    fn from(api: MemoryWorkspaceApi) -> Self {
        WorkspaceApi::Memory(api)
    }
}
