mod config;
mod control;
mod domain;
mod persist;
mod probe;
mod process;
mod remote;
mod rpc_client;
mod runtime;
pub mod service;
mod store;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tabled::Tabled;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::MockpitConfig;
use crate::process::{LogSink, SupervisorCtx};
use crate::rpc_client::RpcClient;
use crate::store::{ManagedServer, ServerRegistry};

#[derive(Clone)]
pub struct SharedState {
    pub registry: Arc<ServerRegistry>,
    pub supervisor: Arc<SupervisorCtx>,
    pub ui_snapshot_path: PathBuf,
    pub settings_path: PathBuf,
}

#[derive(Parser)]
#[command(name = "mockpit", about = "Supervisor for local mock-API servers")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (supervisor + control socket)
    Serve,
    /// List managed servers
    Ls,
    /// Start or stop a server
    Toggle {
        /// Server name (omit when only one is managed)
        server: Option<String>,
    },
    /// Change a server's port (restarts it when running)
    Port {
        port: u16,
        #[arg(long)]
        server: Option<String>,
    },
    /// List routes for a server
    Routes {
        /// Server name (omit when only one is managed)
        server: Option<String>,
    },
    /// Add a route
    Add {
        /// HTTP method: GET, POST, PUT, DELETE
        method: String,
        /// Route path, must start with /
        path: String,
        /// Response body (JSON)
        #[arg(long)]
        response: Option<String>,
        /// Expected request body (JSON)
        #[arg(long)]
        expected_body: Option<String>,
        /// JSON schema for request validation
        #[arg(long)]
        json_schema: Option<String>,
        #[arg(long)]
        server: Option<String>,
    },
    /// Remove a route by method+path or by id
    Rm {
        /// HTTP method (with PATH)
        method: Option<String>,
        /// Route path (with METHOD)
        path: Option<String>,
        /// Route id (database mode)
        #[arg(long)]
        id: Option<String>,
        #[arg(long)]
        server: Option<String>,
    },
    /// Write the active route document and the UI snapshot to disk
    Save {
        #[arg(long)]
        server: Option<String>,
    },
    /// Load a route document from a file
    Load {
        file: PathBuf,
        #[arg(long)]
        server: Option<String>,
    },
    /// Show or switch the configuration mode (file or database)
    Mode {
        /// New mode; omit to show the current one
        mode: Option<String>,
    },
    /// Show recent output from managed servers
    Logs {
        /// Number of lines to show
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },
    /// Pretty-print a JSON file
    Preview { file: PathBuf },
}

fn build_state(cfg: &MockpitConfig) -> anyhow::Result<SharedState> {
    runtime::ensure_runtime_paths(cfg)?;

    let (refresh_tx, _) = broadcast::channel(32);
    let supervisor = Arc::new(SupervisorCtx {
        jar_path: cfg.jar_path.clone(),
        active_config_path: cfg.active_config_path(),
        database_profile: cfg.database_profile.clone(),
        drain_attempts: cfg.drain_attempts,
        drain_backoff: std::time::Duration::from_millis(cfg.drain_backoff_ms),
        logs: Arc::new(LogSink::new(1024)),
        refresh_tx,
    });

    let servers = seed_servers(cfg)?;
    let registry = Arc::new(ServerRegistry::from_servers(servers));

    Ok(SharedState {
        registry,
        supervisor,
        ui_snapshot_path: cfg.ui_snapshot_path(),
        settings_path: cfg.settings_path(),
    })
}

/// Restore servers from the UI snapshot; a missing or empty snapshot
/// bootstraps the single default server.
fn seed_servers(cfg: &MockpitConfig) -> anyhow::Result<Vec<ManagedServer>> {
    let snapshot = match persist::load_ui_snapshot(&cfg.ui_snapshot_path()) {
        Ok(v) => v,
        Err(err) => {
            warn!(error = %err, "unreadable UI snapshot, starting from defaults");
            None
        }
    };

    let servers: Vec<ManagedServer> = match snapshot {
        Some(summaries) if !summaries.is_empty() => {
            summaries.into_iter().map(ManagedServer::from_summary).collect()
        }
        _ => vec![ManagedServer::new(
            cfg.server_name.clone(),
            cfg.server_port,
            cfg.java_path.clone(),
        )],
    };
    Ok(servers)
}

async fn run_serve(cfg: MockpitConfig) -> anyhow::Result<()> {
    let state = build_state(&cfg)?;

    let control_state = state.clone();
    let control_socket = cfg.control_socket.clone();
    let control_task = tokio::spawn(async move {
        if let Err(err) = control::run_control_server(control_socket, control_state).await {
            error!(error = %err, "control server exited with error");
        }
    });

    info!("mockpit started");
    runtime::wait_for_shutdown().await;
    info!("shutdown signal received");

    // Children never outlive the daemon.
    process::shutdown_all(&state.supervisor, &state.registry.handles()).await;

    control_task.abort();
    let _ = std::fs::remove_file(&cfg.control_socket);

    Ok(())
}

#[derive(Tabled)]
struct ServerRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "PORT")]
    port: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "PID")]
    pid: String,
    #[tabled(rename = "CONFIG")]
    config: String,
}

fn run_ls(cfg: MockpitConfig) -> anyhow::Result<()> {
    let client = RpcClient::new(&cfg.control_socket);
    let result = client.call("server.list", serde_json::json!({}))?;

    let mode = result.get("mode").and_then(|m| m.as_str()).unwrap_or("file");
    let servers = result
        .get("servers")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    if servers.is_empty() {
        println!("No servers managed.");
        return Ok(());
    }

    let rows: Vec<ServerRow> = servers
        .iter()
        .map(|s| {
            let running = s.get("running").and_then(|v| v.as_bool()).unwrap_or(false);
            let status = if running {
                "running".green().to_string()
            } else {
                "stopped".dimmed().to_string()
            };
            let pid = s
                .get("pid")
                .and_then(|v| v.as_u64())
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            let config = match s.get("external_config").and_then(|v| v.as_str()) {
                Some(path) => format!("file: {path}"),
                None => {
                    let count = s.get("route_count").and_then(|v| v.as_u64()).unwrap_or(0);
                    format!("ui ({count} routes)")
                }
            };
            ServerRow {
                name: s
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or("?")
                    .bold()
                    .to_string(),
                port: s
                    .get("port")
                    .and_then(|v| v.as_u64())
                    .map(|p| p.to_string())
                    .unwrap_or_default(),
                status,
                pid,
                config,
            }
        })
        .collect();

    use tabled::settings::Style;
    let table = tabled::Table::new(&rows).with(Style::blank()).to_string();
    println!("{table}");
    println!("  mode: {}", mode.cyan());

    Ok(())
}

fn run_toggle(cfg: MockpitConfig, server: Option<String>) -> anyhow::Result<()> {
    let client = RpcClient::new(&cfg.control_socket);
    let result = client.call("server.toggle", serde_json::json!({ "server": server }))?;
    let running = result
        .get("running")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    if running {
        println!("{} server started", "+".green().bold());
    } else {
        println!("{} server stopped", "-".red().bold());
    }
    Ok(())
}

fn run_port(cfg: MockpitConfig, port: u16, server: Option<String>) -> anyhow::Result<()> {
    let client = RpcClient::new(&cfg.control_socket);
    client.call(
        "server.port",
        serde_json::json!({ "server": server, "port": port }),
    )?;
    println!("{} port set to {port}", "=".bold());
    Ok(())
}

#[derive(Tabled)]
struct RouteRow {
    #[tabled(rename = "METHOD")]
    method: String,
    #[tabled(rename = "PATH")]
    path: String,
    #[tabled(rename = "RESPONSE")]
    response: String,
    #[tabled(rename = "ID")]
    id: String,
}

fn run_routes(cfg: MockpitConfig, server: Option<String>) -> anyhow::Result<()> {
    let client = RpcClient::new(&cfg.control_socket);
    let result = client.call("route.list", serde_json::json!({ "server": server }))?;
    let routes = result
        .get("routes")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    if routes.is_empty() {
        println!("No routes defined.");
        return Ok(());
    }

    let rows: Vec<RouteRow> = routes
        .iter()
        .map(|r| {
            let response = r
                .get("response")
                .map(|v| {
                    let raw = v.to_string();
                    if raw.chars().count() > 40 {
                        let cut: String = raw.chars().take(40).collect();
                        format!("{cut}...")
                    } else {
                        raw
                    }
                })
                .unwrap_or_else(|| "-".to_string());
            RouteRow {
                method: r
                    .get("method")
                    .and_then(|v| v.as_str())
                    .unwrap_or("?")
                    .cyan()
                    .to_string(),
                path: r
                    .get("path")
                    .and_then(|v| v.as_str())
                    .unwrap_or("?")
                    .bold()
                    .to_string(),
                response: response.dimmed().to_string(),
                id: r
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or("-")
                    .to_string(),
            }
        })
        .collect();

    use tabled::settings::Style;
    let table = tabled::Table::new(&rows).with(Style::blank()).to_string();
    println!("{table}");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_add(
    cfg: MockpitConfig,
    method: String,
    path: String,
    response: Option<String>,
    expected_body: Option<String>,
    json_schema: Option<String>,
    server: Option<String>,
) -> anyhow::Result<()> {
    let client = RpcClient::new(&cfg.control_socket);
    let result = client.call(
        "route.add",
        serde_json::json!({
            "server": server,
            "method": method,
            "path": path,
            "response": response,
            "expected_body": expected_body,
            "json_schema": json_schema,
        }),
    )?;

    if let Some(warnings) = result.get("warnings").and_then(|v| v.as_array()) {
        for w in warnings {
            if let Some(msg) = w.as_str() {
                println!("  {} {msg}", "!".yellow());
            }
        }
    }
    println!(
        "{} [{}] {}",
        "+".green().bold(),
        method.to_uppercase(),
        path
    );
    Ok(())
}

fn run_rm(
    cfg: MockpitConfig,
    method: Option<String>,
    path: Option<String>,
    id: Option<String>,
    server: Option<String>,
) -> anyhow::Result<()> {
    let client = RpcClient::new(&cfg.control_socket);
    let result = client.call(
        "route.delete",
        serde_json::json!({
            "server": server,
            "method": method,
            "path": path,
            "id": id,
        }),
    )?;
    let removed = result.get("removed").and_then(|v| v.as_u64()).unwrap_or(0);
    if removed == 0 {
        println!("No matching route.");
    } else {
        println!("{} removed {removed} route(s)", "-".red().bold());
    }
    Ok(())
}

fn run_save(cfg: MockpitConfig, server: Option<String>) -> anyhow::Result<()> {
    let client = RpcClient::new(&cfg.control_socket);
    client.call("config.save", serde_json::json!({ "server": server }))?;
    println!("{} configuration saved", "=".bold());
    Ok(())
}

fn run_load(cfg: MockpitConfig, file: PathBuf, server: Option<String>) -> anyhow::Result<()> {
    let file = file
        .canonicalize()
        .with_context(|| format!("cannot resolve {}", file.display()))?;
    let client = RpcClient::new(&cfg.control_socket);
    let result = client.call(
        "config.load",
        serde_json::json!({ "server": server, "path": file.to_string_lossy() }),
    )?;
    let loaded = result.get("loaded").and_then(|v| v.as_u64()).unwrap_or(0);
    println!(
        "{} loaded {loaded} route(s) from {}",
        "+".green().bold(),
        file.display()
    );
    Ok(())
}

fn run_mode(cfg: MockpitConfig, mode: Option<String>) -> anyhow::Result<()> {
    let client = RpcClient::new(&cfg.control_socket);
    match mode {
        None => {
            let result = client.call("mode.get", serde_json::json!({}))?;
            let mode = result.get("mode").and_then(|v| v.as_str()).unwrap_or("file");
            println!("{}", mode.cyan());
        }
        Some(mode) => {
            client.call("mode.select", serde_json::json!({ "mode": mode }))?;
            println!("{} mode set to {}", "=".bold(), mode.cyan());
        }
    }
    Ok(())
}

fn run_logs(cfg: MockpitConfig, lines: usize) -> anyhow::Result<()> {
    let client = RpcClient::new(&cfg.control_socket);
    let result = client.call("logs.tail", serde_json::json!({ "lines": lines }))?;
    let events = result
        .get("events")
        .and_then(|v| v.as_array())
        .cloned()
        .unwrap_or_default();

    if events.is_empty() {
        println!("No log output.");
        return Ok(());
    }

    for event in events {
        let server = event.get("server").and_then(|v| v.as_str()).unwrap_or("?");
        let stream = event.get("stream").and_then(|v| v.as_str()).unwrap_or("?");
        let line = event.get("line").and_then(|v| v.as_str()).unwrap_or("");
        let tag = match stream {
            "stderr" => server.red().to_string(),
            "supervisor" => server.yellow().to_string(),
            _ => server.dimmed().to_string(),
        };
        println!("{tag} {line}");
    }
    Ok(())
}

fn run_preview(file: PathBuf) -> anyhow::Result<()> {
    let raw = std::fs::read_to_string(&file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    let value: serde_json::Value = serde_json::from_str(&raw)
        .with_context(|| format!("{} is not valid JSON", file.display()))?;
    println!("{}", service::preview_json(&value));
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    runtime::init_tracing();
    let cfg = MockpitConfig::load().context("failed to load config")?;

    let cli = Cli::parse();
    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => run_serve(cfg).await,
        Commands::Ls => run_ls(cfg),
        Commands::Toggle { server } => run_toggle(cfg, server),
        Commands::Port { port, server } => run_port(cfg, port, server),
        Commands::Routes { server } => run_routes(cfg, server),
        Commands::Add {
            method,
            path,
            response,
            expected_body,
            json_schema,
            server,
        } => run_add(cfg, method, path, response, expected_body, json_schema, server),
        Commands::Rm {
            method,
            path,
            id,
            server,
        } => run_rm(cfg, method, path, id, server),
        Commands::Save { server } => run_save(cfg, server),
        Commands::Load { file, server } => run_load(cfg, file, server),
        Commands::Mode { mode } => run_mode(cfg, mode),
        Commands::Logs { lines } => run_logs(cfg, lines),
        Commands::Preview { file } => run_preview(file),
    }
}
