//! Workspace operations: REST calls gated on bus events.
//!
//! Event-gated operations (`start`, `stop`, `execute_command`) follow one
//! sequence:
//!
//! 1. read the current descriptor (machine ids come from this read);
//! 2. get or open the workspace's bus (the connect is awaited);
//! 3. attach a completion adapter, which sends the subscription frames;
//! 4. issue the REST mutation;
//! 5. wait for the terminal event, bounded by the operation timeout;
//! 6. read the descriptor back.
//!
//! The bus is closed on every exit path: by the adapter when it settles, and
//! here when the mutation fails or the wait times out.

pub mod api;
pub mod topics;
pub mod types;

use std::future::Future;
use std::time::Duration;

use tracing::{debug, info};

use crate::bus::completion::{self, Watch};
use crate::bus::registry::BusRegistry;
use crate::error::AppError;
use crate::readiness::Poller;

use api::WorkspaceApi;
use types::{Command, CreateWorkspaceConfig, WorkspaceDescriptor, WorkspaceStatus};

/// Flat settings the client needs; built from the config file by
/// [`crate::config::Config::client_config`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// REST root, e.g. `http://localhost:8080`.
    pub api_url: String,
    /// WebSocket root, e.g. `ws://localhost:8080`.
    pub ws_url: String,
    pub token: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub operation_timeout: Duration,
    pub heartbeat: Duration,
}

impl ClientConfig {
    pub fn new(host: &str, port: u16) -> Self {
        Self {
            api_url: format!("http://{host}:{port}"),
            ws_url: format!("ws://{host}:{port}"),
            token: None,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(300),
            heartbeat: Duration::from_secs(50),
        }
    }

    /// Event channel URL for one workspace.
    pub fn channel_url(&self, workspace_id: &str) -> String {
        let base = self.ws_url.trim_end_matches('/');
        match &self.token {
            Some(token) => format!("{base}/api/ws/{workspace_id}?token={token}"),
            None => format!("{base}/api/ws/{workspace_id}"),
        }
    }
}

pub struct WorkspaceClient {
    config: ClientConfig,
    api: WorkspaceApi,
    registry: BusRegistry,
}

impl WorkspaceClient {
    pub fn new(config: ClientConfig, api: impl Into<WorkspaceApi>, registry: BusRegistry) -> Self {
        Self {
            config,
            api: api.into(),
            registry,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn registry(&self) -> &BusRegistry {
        &self.registry
    }

    // ── Plain REST ────────────────────────────────────────────────────────────

    pub async fn create(&self, config: &CreateWorkspaceConfig) -> Result<WorkspaceDescriptor, AppError> {
        let ws = self.api.create(config).await?;
        info!(id = %ws.id, name = %ws.name(), "workspace created");
        Ok(ws)
    }

    pub async fn delete(&self, id: &str) -> Result<(), AppError> {
        self.api.delete(id).await?;
        info!(%id, "workspace deleted");
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<WorkspaceDescriptor, AppError> {
        self.api.get(key).await
    }

    /// Like [`get`](Self::get) but a 404 is `Ok(None)`.
    pub async fn find(&self, key: &str) -> Result<Option<WorkspaceDescriptor>, AppError> {
        match self.api.get(key).await {
            Ok(ws) => Ok(Some(ws)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn find_by_name(&self, name: &str) -> Result<Option<WorkspaceDescriptor>, AppError> {
        self.find(&format!(":{name}")).await
    }

    pub async fn list(&self) -> Result<Vec<WorkspaceDescriptor>, AppError> {
        self.api.list().await
    }

    /// Poll the REST API until it answers.
    pub async fn wait_until_reachable(&self, poller: &Poller) -> Result<u32, AppError> {
        poller.poll(|| self.api.ping()).await
    }

    // ── Event-gated ───────────────────────────────────────────────────────────

    /// Start a workspace and wait until it (or its dev machine) is RUNNING.
    /// Returns the descriptor read back after the event.
    pub async fn start(&self, id: &str) -> Result<WorkspaceDescriptor, AppError> {
        let current = self.api.get(id).await?;
        if current.status == WorkspaceStatus::Running {
            info!(%id, "workspace already running");
            return Ok(current);
        }

        let environment = current.environment().to_string();
        let watched = [
            topics::workspace(&current.id),
            topics::machine_status(&current.id, &environment),
        ];

        info!(%id, %environment, "starting workspace");
        self.gated(
            &current.id,
            &watched,
            Watch::workspace_running(),
            self.api.start(&current.id, &environment),
        )
        .await?;

        let ws = self.api.get(&current.id).await?;
        info!(%id, status = %ws.status, "workspace started");
        Ok(ws)
    }

    /// Stop a workspace and wait for STOPPED.
    pub async fn stop(&self, id: &str) -> Result<WorkspaceDescriptor, AppError> {
        let current = self.api.get(id).await?;
        if current.status == WorkspaceStatus::Stopped {
            info!(%id, "workspace already stopped");
            return Ok(current);
        }

        info!(%id, "stopping workspace");
        self.gated(
            &current.id,
            &[topics::workspace(&current.id)],
            Watch::workspace_stopped(),
            self.api.stop(&current.id),
        )
        .await?;

        let ws = self.api.get(&current.id).await?;
        info!(%id, status = %ws.status, "workspace stopped");
        Ok(ws)
    }

    /// Run `command` on the workspace's dev machine and wait for the process
    /// to end. Output lines are logged at `debug`.
    ///
    /// The dev machine is taken from a fresh read of the workspace, not from
    /// `workspace`, which may predate a restart.
    pub async fn execute_command(
        &self,
        workspace: &WorkspaceDescriptor,
        command: &Command,
    ) -> Result<bool, AppError> {
        let current = self.api.get(&workspace.id).await?;
        let machine_id = current.dev_machine_id().ok_or_else(|| {
            AppError::Protocol(format!("workspace {} has no running dev machine", current.id))
        })?;
        let channel = topics::new_process_channel();

        info!(workspace = %current.id, machine = %machine_id, command = %command.name, "executing command");
        self.gated(
            &current.id,
            std::slice::from_ref(&channel),
            Watch::process_terminated(),
            self.api.execute_command(&current.id, machine_id, command, &channel),
        )
        .await
    }

    async fn gated<T, M>(
        &self,
        workspace_id: &str,
        watched: &[String],
        watch: Watch<T>,
        mutation: M,
    ) -> Result<T, AppError>
    where
        T: Send + 'static,
        M: Future<Output = Result<(), AppError>>,
    {
        let url = self.config.channel_url(workspace_id);
        let bus = self.registry.get_or_create(workspace_id, &url).await?;

        let done = match completion::attach(&bus, watched, watch).await {
            Ok(done) => done,
            Err(e) => {
                bus.close();
                return Err(e);
            }
        };

        if let Err(e) = mutation.await {
            debug!(workspace = %workspace_id, error = %e, "mutation failed; closing bus");
            bus.close();
            return Err(e);
        }

        let outcome = done.wait_timeout(self.config.operation_timeout).await;
        if outcome.is_err() {
            bus.close();
        }
        outcome
    }
}
