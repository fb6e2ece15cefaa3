//! Configuration loading with env-var overrides.
//!
//! Reads `config/default.toml` relative to the current working directory (or
//! the file given with `--config`), then applies `CHEDIR_WORK_DIR`,
//! `CHEDIR_LOG_LEVEL` and `CHEDIR_TOKEN` env overrides.

use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::Deserialize;

use crate::error::AppError;
use crate::workspace::ClientConfig;
use crate::workspace::types::{Command, CreateWorkspaceConfig};

/// Workspace server location and credentials.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Auth token sent as the `token` query parameter. `None` on a
    /// single-user server.
    pub token: Option<String>,
}

/// One action run after the workspace has started.
#[derive(Debug, Clone, PartialEq)]
pub enum PostLoadAction {
    /// Run the workspace command with this name.
    Command(String),
    /// Run this command line as a one-off command.
    Script(String),
}

/// The workspace this directory maps to.
#[derive(Debug, Clone)]
pub struct WorkspaceSettings {
    pub name: String,
    pub ram_mb: u32,
    pub environment: String,
    pub commands: Vec<Command>,
    pub post_load: Vec<PostLoadAction>,
}

impl WorkspaceSettings {
    /// Body for creating this workspace when it does not exist yet.
    pub fn create_config(&self) -> CreateWorkspaceConfig {
        CreateWorkspaceConfig {
            name: self.name.clone(),
            default_env: self.environment.clone(),
            ram: self.ram_mb,
            commands: self.commands.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub connect: Duration,
    pub request: Duration,
    /// Upper bound on waiting for a terminal event.
    pub operation: Duration,
}

#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    pub attempts: u32,
    pub interval: Duration,
}

/// Fully-resolved client configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Local cache directory (already expanded, no `~`).
    pub work_dir: PathBuf,
    pub log_level: String,
    pub server: ServerConfig,
    pub workspace: WorkspaceSettings,
    pub timeouts: TimeoutConfig,
    pub readiness: ReadinessConfig,
    /// Interval between heartbeat frames on an idle bus.
    pub heartbeat: Duration,
}

impl Config {
    /// Flat settings for [`crate::workspace::WorkspaceClient`].
    pub fn client_config(&self) -> ClientConfig {
        let mut client = ClientConfig::new(&self.server.host, self.server.port);
        client.token = self.server.token.clone();
        client.connect_timeout = self.timeouts.connect;
        client.request_timeout = self.timeouts.request;
        client.operation_timeout = self.timeouts.operation;
        client.heartbeat = self.heartbeat;
        client
    }
}

/// Env-var overrides, passed explicitly so tests need not touch the process env.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub work_dir: Option<String>,
    pub log_level: Option<String>,
    pub token: Option<String>,
}

impl Overrides {
    pub fn from_env() -> Self {
        Self {
            work_dir: env::var("CHEDIR_WORK_DIR").ok(),
            log_level: env::var("CHEDIR_LOG_LEVEL").ok(),
            token: env::var("CHEDIR_TOKEN").ok(),
        }
    }
}

/// Raw TOML shape, the `serde` target before resolution.
#[derive(Deserialize)]
struct RawConfig {
    client: RawClient,
    #[serde(default)]
    server: RawServer,
    workspace: RawWorkspace,
    #[serde(default)]
    timeouts: RawTimeouts,
    #[serde(default)]
    readiness: RawReadiness,
    #[serde(default)]
    bus: RawBus,
}

#[derive(Deserialize)]
struct RawClient {
    work_dir: String,
    #[serde(default = "default_log_level")]
    log_level: String,
}

#[derive(Deserialize)]
struct RawServer {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    token: Option<String>,
}

impl Default for RawServer {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            token: None,
        }
    }
}

#[derive(Deserialize)]
struct RawWorkspace {
    name: String,
    #[serde(default = "default_ram_mb")]
    ram_mb: u32,
    #[serde(default = "default_environment")]
    environment: String,
    #[serde(default)]
    commands: Vec<RawCommand>,
    #[serde(default)]
    post_load: Vec<RawPostLoad>,
}

#[derive(Deserialize)]
struct RawCommand {
    name: String,
    command_line: String,
    #[serde(rename = "type", default = "default_command_type")]
    kind: String,
}

/// `{ command = "build" }` or `{ script = "npm install" }`.
#[derive(Deserialize)]
struct RawPostLoad {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    script: Option<String>,
}

#[derive(Deserialize)]
struct RawTimeouts {
    #[serde(default = "default_connect_secs")]
    connect_secs: u64,
    #[serde(default = "default_request_secs")]
    request_secs: u64,
    #[serde(default = "default_operation_secs")]
    operation_secs: u64,
}

impl Default for RawTimeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            request_secs: default_request_secs(),
            operation_secs: default_operation_secs(),
        }
    }
}

#[derive(Deserialize)]
struct RawReadiness {
    #[serde(default = "default_attempts")]
    attempts: u32,
    #[serde(default = "default_interval_ms")]
    interval_ms: u64,
}

impl Default for RawReadiness {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            interval_ms: default_interval_ms(),
        }
    }
}

#[derive(Deserialize)]
struct RawBus {
    #[serde(default = "default_heartbeat_secs")]
    heartbeat_secs: u64,
}

impl Default for RawBus {
    fn default() -> Self {
        Self { heartbeat_secs: default_heartbeat_secs() }
    }
}

fn default_log_level() -> String { "info".to_string() }
fn default_host() -> String { "localhost".to_string() }
fn default_port() -> u16 { 8080 }
fn default_ram_mb() -> u32 { 2048 }
fn default_environment() -> String { "default".to_string() }
fn default_command_type() -> String { "custom".to_string() }
fn default_connect_secs() -> u64 { 10 }
fn default_request_secs() -> u64 { 30 }
fn default_operation_secs() -> u64 { 300 }
fn default_attempts() -> u32 { 30 }
fn default_interval_ms() -> u64 { 1000 }
fn default_heartbeat_secs() -> u64 { 50 }

/// Load config from `config/default.toml`, then apply env-var overrides.
pub fn load() -> Result<Config, AppError> {
    load_from(Path::new("config/default.toml"), &Overrides::from_env())
}

/// Internal loader; accepts an explicit path and overrides.
pub fn load_from(path: &Path, overrides: &Overrides) -> Result<Config, AppError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = toml::from_str(&raw)
        .map_err(|e| AppError::Config(format!("invalid {}: {e}", path.display())))?;

    let work_dir = expand_home(overrides.work_dir.as_deref().unwrap_or(&parsed.client.work_dir));
    let log_level = overrides
        .log_level
        .clone()
        .unwrap_or(parsed.client.log_level);
    let token = overrides
        .token
        .clone()
        .or(parsed.server.token)
        .filter(|t| !t.is_empty());

    if parsed.workspace.name.trim().is_empty() {
        return Err(AppError::Config("[workspace].name must not be empty".into()));
    }

    let commands: Vec<Command> = parsed
        .workspace
        .commands
        .into_iter()
        // Unnamed commands cannot be referenced; drop them.
        .filter(|c| !c.name.is_empty())
        .map(|c| Command {
            name: c.name,
            command_line: c.command_line,
            kind: c.kind,
        })
        .collect();

    let post_load = parsed
        .workspace
        .post_load
        .into_iter()
        .map(|action| match (action.command, action.script) {
            (Some(name), None) => Ok(PostLoadAction::Command(name)),
            (None, Some(script)) => Ok(PostLoadAction::Script(script)),
            _ => Err(AppError::Config(
                "each [[workspace.post_load]] needs exactly one of `command` or `script`".into(),
            )),
        })
        .collect::<Result<Vec<_>, _>>()?;

    if parsed.bus.heartbeat_secs == 0 {
        return Err(AppError::Config("[bus].heartbeat_secs must be at least 1".into()));
    }

    Ok(Config {
        work_dir,
        log_level,
        server: ServerConfig {
            host: parsed.server.host,
            port: parsed.server.port,
            token,
        },
        workspace: WorkspaceSettings {
            name: parsed.workspace.name,
            ram_mb: parsed.workspace.ram_mb,
            environment: parsed.workspace.environment,
            commands,
            post_load,
        },
        timeouts: TimeoutConfig {
            connect: Duration::from_secs(parsed.timeouts.connect_secs),
            request: Duration::from_secs(parsed.timeouts.request_secs),
            operation: Duration::from_secs(parsed.timeouts.operation_secs),
        },
        readiness: ReadinessConfig {
            attempts: parsed.readiness.attempts,
            interval: Duration::from_millis(parsed.readiness.interval_ms),
        },
        heartbeat: Duration::from_secs(parsed.bus.heartbeat_secs),
    })
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

// ── test helpers ──────────────────────────────────────────────────────────────

#[cfg(test)]
impl Config {
    pub fn test_default(work_dir: &Path) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            log_level: "info".into(),
            server: ServerConfig {
                host: "localhost".into(),
                port: 0,
                token: None,
            },
            workspace: WorkspaceSettings {
                name: "test".into(),
                ram_mb: 512,
                environment: "default".into(),
                commands: vec![],
                post_load: vec![],
            },
            timeouts: TimeoutConfig {
                connect: Duration::from_secs(1),
                request: Duration::from_secs(1),
                operation: Duration::from_secs(1),
            },
            readiness: ReadinessConfig {
                attempts: 1,
                interval: Duration::from_millis(1),
            },
            heartbeat: Duration::from_secs(50),
        }
    }
}
