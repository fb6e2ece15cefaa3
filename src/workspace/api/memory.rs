//! In-memory workspace server state for tests and offline runs.
//!
//! Mutations are applied immediately and also reported on a channel so a
//! test can wait for "the start request has been issued" before emitting
//! events on the bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::AppError;
use crate::workspace::types::{
    Command, CreateWorkspaceConfig, Link, Machine, Runtime, WorkspaceConfig, WorkspaceDescriptor,
    WorkspaceStatus,
};

/// A state-changing call observed by the memory API.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Create { id: String },
    Start { id: String, environment: String },
    Stop { id: String },
    Delete { id: String },
    Execute { id: String, machine_id: String, command: Command, channel: String },
}

#[derive(Debug, Clone)]
pub struct MemoryWorkspaceApi {
    inner: Arc<MemoryApiInner>,
}

#[derive(Debug)]
struct MemoryApiInner {
    workspaces: Mutex<HashMap<String, WorkspaceDescriptor>>,
    next_id: AtomicU64,
    reachable: AtomicBool,
    fail_next: Mutex<Option<(u16, String)>>,
    fail_mutation: Mutex<Option<(u16, String)>>,
    mutations_tx: mpsc::UnboundedSender<Mutation>,
    mutations_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Mutation>>,
}

impl Default for MemoryWorkspaceApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryWorkspaceApi {
    pub fn new() -> Self {
        let (mutations_tx, mutations_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(MemoryApiInner {
                workspaces: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                reachable: AtomicBool::new(true),
                fail_next: Mutex::new(None),
                fail_mutation: Mutex::new(None),
                mutations_tx,
                mutations_rx: tokio::sync::Mutex::new(mutations_rx),
            }),
        }
    }

    /// Seed a workspace directly, bypassing `create`.
    pub fn insert(&self, workspace: WorkspaceDescriptor) {
        self.inner
            .workspaces
            .lock()
            .insert(workspace.id.clone(), workspace);
    }

    /// Make `ping` report the server as up or down.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Answer the next call with HTTP `status` and `body`.
    pub fn fail_next(&self, status: u16, body: impl Into<String>) {
        *self.inner.fail_next.lock() = Some((status, body.into()));
    }

    /// Answer the next state-changing call with HTTP `status` and `body`;
    /// reads are unaffected.
    pub fn fail_next_mutation(&self, status: u16, body: impl Into<String>) {
        *self.inner.fail_mutation.lock() = Some((status, body.into()));
    }

    /// Next mutation issued against this API.
    pub async fn next_mutation(&self) -> Option<Mutation> {
        self.inner.mutations_rx.lock().await.recv().await
    }

    fn record(&self, mutation: Mutation) {
        // The receiver lives as long as `inner`.
        let _ = self.inner.mutations_tx.send(mutation);
    }

    fn check_failure(&self, path: &str) -> Result<(), AppError> {
        Self::fail(self.inner.fail_next.lock().take(), path)
    }

    fn check_mutation_failure(&self, path: &str) -> Result<(), AppError> {
        self.check_failure(path)?;
        Self::fail(self.inner.fail_mutation.lock().take(), path)
    }

    fn fail(injected: Option<(u16, String)>, path: &str) -> Result<(), AppError> {
        match injected {
            Some((status, body)) => Err(AppError::Rest {
                status,
                url: format!("memory:///api/workspace{path}"),
                body,
            }),
            None => Ok(()),
        }
    }

    fn not_found(key: &str) -> AppError {
        AppError::Rest {
            status: 404,
            url: format!("memory:///api/workspace/{key}"),
            body: format!(r#"{{"message":"Workspace with key '{key}' doesn't exist"}}"#),
        }
    }

    /// Apply `f` to the workspace stored under `id`.
    fn update<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut WorkspaceDescriptor) -> T,
    ) -> Result<T, AppError> {
        let mut workspaces = self.inner.workspaces.lock();
        let ws = workspaces.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        Ok(f(ws))
    }

    pub async fn ping(&self) -> Result<bool, AppError> {
        self.check_failure("")?;
        Ok(self.inner.reachable.load(Ordering::SeqCst))
    }

    pub async fn list(&self) -> Result<Vec<WorkspaceDescriptor>, AppError> {
        self.check_failure("")?;
        let mut all: Vec<_> = self.inner.workspaces.lock().values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    /// `key` is a workspace id, or `:<name>`.
    pub async fn get(&self, key: &str) -> Result<WorkspaceDescriptor, AppError> {
        self.check_failure(&format!("/{key}"))?;
        let workspaces = self.inner.workspaces.lock();
        let found = match key.strip_prefix(':') {
            Some(name) => workspaces.values().find(|ws| ws.config.name == name),
            None => workspaces.get(key),
        };
        found.cloned().ok_or_else(|| Self::not_found(key))
    }

    pub async fn create(&self, config: &CreateWorkspaceConfig) -> Result<WorkspaceDescriptor, AppError> {
        self.check_mutation_failure("")?;
        let id = format!("workspace{}", self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let ws = WorkspaceDescriptor {
            id: id.clone(),
            status: WorkspaceStatus::Stopped,
            config: WorkspaceConfig {
                name: config.name.clone(),
                default_env: config.default_env.clone(),
                commands: config.commands.clone(),
            },
            runtime: None,
            links: vec![Link {
                rel: "ide url".into(),
                href: format!("memory:///che/{}", config.name),
            }],
        };
        self.insert(ws.clone());
        self.record(Mutation::Create { id });
        Ok(ws)
    }

    pub async fn start(&self, id: &str, environment: &str) -> Result<(), AppError> {
        self.check_mutation_failure(&format!("/{id}/runtime"))?;
        self.update(id, |ws| {
            ws.status = WorkspaceStatus::Running;
            ws.runtime = Some(Runtime {
                dev_machine: Some(Machine { id: format!("machine-{id}") }),
            });
        })?;
        self.record(Mutation::Start {
            id: id.to_string(),
            environment: environment.to_string(),
        });
        Ok(())
    }

    pub async fn stop(&self, id: &str) -> Result<(), AppError> {
        self.check_mutation_failure(&format!("/{id}/runtime"))?;
        self.update(id, |ws| {
            ws.status = WorkspaceStatus::Stopped;
            ws.runtime = None;
        })?;
        self.record(Mutation::Stop { id: id.to_string() });
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<(), AppError> {
        self.check_mutation_failure(&format!("/{id}"))?;
        self.inner
            .workspaces
            .lock()
            .remove(id)
            .ok_or_else(|| Self::not_found(id))?;
        self.record(Mutation::Delete { id: id.to_string() });
        Ok(())
    }

    pub async fn execute_command(
        &self,
        id: &str,
        machine_id: &str,
        command: &Command,
        output_channel: &str,
    ) -> Result<(), AppError> {
        self.check_mutation_failure(&format!("/{id}/machine/{machine_id}/command"))?;
        self.update(id, |_| ())?;
        self.record(Mutation::Execute {
            id: id.to_string(),
            machine_id: machine_id.to_string(),
            command: command.clone(),
            channel: output_channel.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(name: &str) -> CreateWorkspaceConfig {
        CreateWorkspaceConfig {
            name: name.into(),
            default_env: "default".into(),
            ram: 2048,
            commands: vec![],
        }
    }

    #[tokio::test]
    async fn create_then_lookup_by_name() {
        let api = MemoryWorkspaceApi::new();
        let ws = api.create(&config("chedir")).await.unwrap();
        assert_eq!(api.next_mutation().await, Some(Mutation::Create { id: ws.id.clone() }));

        let found = api.get(":chedir").await.unwrap();
        assert_eq!(found.id, ws.id);
        assert_eq!(found.ide_url(), Some("memory:///che/chedir"));
        assert!(api.get(":other").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn start_and_stop_flip_status() {
        let api = MemoryWorkspaceApi::new();
        let ws = api.create(&config("chedir")).await.unwrap();

        api.start(&ws.id, "default").await.unwrap();
        let running = api.get(&ws.id).await.unwrap();
        assert_eq!(running.status, WorkspaceStatus::Running);
        assert!(running.dev_machine_id().is_some());

        api.stop(&ws.id).await.unwrap();
        let stopped = api.get(&ws.id).await.unwrap();
        assert_eq!(stopped.status, WorkspaceStatus::Stopped);
        assert_eq!(stopped.dev_machine_id(), None);
    }

    #[tokio::test]
    async fn injected_failure_hits_one_call() {
        let api = MemoryWorkspaceApi::new();
        api.fail_next(500, "boom");
        match api.list().await {
            Err(AppError::Rest { status: 500, body, .. }) => assert_eq!(body, "boom"),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(api.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn mutation_failure_skips_reads() {
        let api = MemoryWorkspaceApi::new();
        let ws = api.create(&config("chedir")).await.unwrap();
        api.fail_next_mutation(409, "conflict");
        assert!(api.get(&ws.id).await.is_ok());
        assert!(matches!(
            api.start(&ws.id, "default").await,
            Err(AppError::Rest { status: 409, .. })
        ));
        assert!(api.start(&ws.id, "default").await.is_ok());
    }

    #[tokio::test]
    async fn delete_unknown_is_not_found() {
        let api = MemoryWorkspaceApi::new();
        assert!(api.delete("nope").await.unwrap_err().is_not_found());
    }
}
