//! `chedir`: map the current directory to a remote workspace.
//!
//! # Usage
//!
//! ```text
//! chedir [--config <path>] [--verbose] <command>
//!
//! Commands:
//!   init     create the local instance id and cache directory
//!   up       wait for the server, create/start the workspace, run post-load actions
//!   down     stop the workspace
//!   status   show workspace name, status and IDE URL
//! ```
//!
//! Startup sequence:
//!   1. Load .env (if present)
//!   2. Parse args
//!   3. Load config
//!   4. Init logger at the configured level (`--verbose` forces `debug`)
//!   5. Run the command

use std::path::PathBuf;

use tracing::info;

use chedir::bus::registry::BusRegistry;
use chedir::config::{self, Config, Overrides, PostLoadAction};
use chedir::error::AppError;
use chedir::instance;
use chedir::logger;
use chedir::readiness::Poller;
use chedir::transport::websocket::WebSocketTransport;
use chedir::workspace::WorkspaceClient;
use chedir::workspace::api::HttpWorkspaceApi;
use chedir::workspace::types::{Command, WorkspaceDescriptor};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

// ── CLI arg parsing ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Init,
    Up,
    Down,
    Status,
}

#[derive(Debug, PartialEq)]
struct Args {
    config: Option<PathBuf>,
    verbose: bool,
    action: Option<Action>,
    help: bool,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args, AppError> {
    let mut parsed = Args {
        config: None,
        verbose: false,
        action: None,
        help: false,
    };
    let mut iter = args.into_iter();

    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter
                    .next()
                    .ok_or_else(|| AppError::Config("--config needs a path".into()))?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--verbose" | "-v" => parsed.verbose = true,
            "--help" | "-h" => parsed.help = true,
            other if parsed.action.is_none() => {
                parsed.action = Some(match other {
                    "init" => Action::Init,
                    "up" => Action::Up,
                    "down" => Action::Down,
                    "status" => Action::Status,
                    _ => {
                        return Err(AppError::Config(format!(
                            "invalid command '{other}': only init, up, down and status are supported"
                        )));
                    }
                });
            }
            other => return Err(AppError::Config(format!("unexpected argument '{other}'"))),
        }
    }

    Ok(parsed)
}

fn print_help() {
    eprintln!("usage: chedir [--config <path>] [--verbose] <command>");
    eprintln!();
    eprintln!("commands:");
    eprintln!("  init     create the local instance id and cache directory");
    eprintln!("  up       start (creating if needed) the workspace and run post-load actions");
    eprintln!("  down     stop the workspace");
    eprintln!("  status   show workspace name, status and IDE URL");
    eprintln!();
    eprintln!("flags:");
    eprintln!("  --config, -c <path>   config file (default: config/default.toml)");
    eprintln!("  --verbose, -v         log at debug level");
    eprintln!("  --help, -h            print this help");
}

// ── Commands ───────────────────────────────────────────────────────────────

async fn run() -> Result<(), AppError> {
    // .env is optional.
    let _ = dotenvy::dotenv();

    let args = parse_args(std::env::args().skip(1))?;
    if args.help {
        print_help();
        return Ok(());
    }
    let Some(action) = args.action else {
        print_help();
        return Err(AppError::Config(
            "missing command: one of init, up, down or status".into(),
        ));
    };

    let config = match &args.config {
        Some(path) => config::load_from(path, &Overrides::from_env())?,
        None => config::load()?,
    };

    let level = if args.verbose { "debug" } else { config.log_level.as_str() };
    logger::parse_level(level)?;
    logger::init(level, args.verbose)?;

    info!(
        work_dir = %config.work_dir.display(),
        workspace = %config.workspace.name,
        server = %format!("{}:{}", config.server.host, config.server.port),
        "config loaded"
    );

    match action {
        Action::Init => init(&config),
        Action::Up => up(&config).await,
        Action::Down => down(&config).await,
        Action::Status => status(&config).await,
    }
}

fn init(config: &Config) -> Result<(), AppError> {
    let inst = instance::setup(&config.work_dir)?;
    println!("✓ Initialized: instance_id={}", inst.instance_id);
    Ok(())
}

fn client(config: &Config) -> Result<WorkspaceClient, AppError> {
    let client_config = config.client_config();
    let api = HttpWorkspaceApi::new(
        client_config.api_url.clone(),
        client_config.token.clone(),
        client_config.request_timeout,
    )?;
    let transport = WebSocketTransport::new(client_config.connect_timeout, client_config.heartbeat);
    Ok(WorkspaceClient::new(client_config, api, BusRegistry::new(transport)))
}

fn require_initialized(config: &Config, what: &str) -> Result<instance::Instance, AppError> {
    if !instance::is_initialized(&config.work_dir) {
        return Err(AppError::Instance(format!(
            "{} has not been initialized, so {what} is not available; run `chedir init` first",
            config.work_dir.display()
        )));
    }
    instance::setup(&config.work_dir)
}

async fn up(config: &Config) -> Result<(), AppError> {
    instance::setup(&config.work_dir)?;
    let client = client(config)?;

    let poller = Poller::new(config.readiness.attempts, config.readiness.interval);
    client.wait_until_reachable(&poller).await?;
    println!("✓ Server reachable at {}", client.config().api_url);

    let ws = match client.find_by_name(&config.workspace.name).await? {
        Some(ws) => {
            info!(id = %ws.id, "using existing workspace");
            ws
        }
        None => client.create(&config.workspace.create_config()).await?,
    };

    println!("… Starting workspace {}", ws.name());
    let ws = client.start(&ws.id).await?;

    run_post_load(&client, &ws, &config.workspace.post_load).await?;

    println!("✓ Workspace {} is {}", ws.name(), ws.status);
    if let Some(url) = ws.ide_url() {
        println!("  Connect to {url}");
    }
    Ok(())
}

/// Post-load actions run one after another: each completion closes the
/// workspace's bus, so the next action opens a fresh one.
async fn run_post_load(
    client: &WorkspaceClient,
    ws: &WorkspaceDescriptor,
    actions: &[PostLoadAction],
) -> Result<(), AppError> {
    for action in actions {
        let command = post_load_command(ws, action)?;
        println!("… Running {}", command.name);
        client.execute_command(ws, &command).await?;
    }
    Ok(())
}

/// Named actions are looked up in the workspace's own command list, which
/// may differ from the commands in the local config.
fn post_load_command(ws: &WorkspaceDescriptor, action: &PostLoadAction) -> Result<Command, AppError> {
    match action {
        PostLoadAction::Command(name) => ws.command(name).cloned().ok_or_else(|| {
            AppError::Config(format!("workspace {} has no command '{name}'", ws.name()))
        }),
        PostLoadAction::Script(line) => Ok(Command::custom("custom postloading command", line.as_str())),
    }
}

async fn down(config: &Config) -> Result<(), AppError> {
    require_initialized(config, "down")?;
    let client = client(config)?;

    let ws = client
        .find_by_name(&config.workspace.name)
        .await?
        .ok_or_else(|| {
            AppError::Config(format!("workspace '{}' does not exist", config.workspace.name))
        })?;

    let ws = client.stop(&ws.id).await?;
    println!("✓ Workspace {} is {}", ws.name(), ws.status);
    Ok(())
}

async fn status(config: &Config) -> Result<(), AppError> {
    let inst = require_initialized(config, "status")?;
    let client = client(config)?;

    let ws = client
        .find_by_name(&config.workspace.name)
        .await?
        .ok_or_else(|| {
            AppError::Config(format!("workspace '{}' does not exist", config.workspace.name))
        })?;

    println!("Workspace:   {}", ws.name());
    println!("Status:      {}", ws.status);
    println!("IDE URL:     {}", ws.ide_url().unwrap_or("-"));
    println!("Instance id: {}", inst.instance_id);
    Ok(())
}
