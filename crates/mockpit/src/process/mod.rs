pub mod logs;

pub use logs::{LogEvent, LogSink, LogStream};

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::domain::ApiMode;
use crate::persist;
use crate::probe;
use crate::store::{ManagedServer, ServerHandle};

/// Launch-argument property naming the route file the jar loads at
/// startup. Compatibility contract with the bundled server binary.
const ROUTE_FILE_PROPERTY: &str = "it.stapedev.api.mokkybuddy.loader.mock.route.file";

/// How often the exit monitor polls a live child.
const MONITOR_POLL_MS: u64 = 200;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("port {0} already in use")]
    PortUnavailable(u16),
    #[error("server jar not found: {0}")]
    BinaryMissing(PathBuf),
    #[error("active config not found: {0}")]
    ConfigMissing(PathBuf),
    #[error("java executable not found: {0}")]
    ExecutableMissing(String),
    #[error("port {0} did not free up after stop")]
    DrainTimeout(u16),
    #[error(transparent)]
    Io(#[from] anyhow::Error),
    #[error("failed to spawn server process: {0}")]
    Spawn(std::io::Error),
}

/// Everything the supervisor needs besides the server record itself.
/// Owned by the daemon state and shared with monitor tasks.
pub struct SupervisorCtx {
    pub jar_path: PathBuf,
    pub active_config_path: PathBuf,
    pub database_profile: String,
    pub drain_attempts: u32,
    pub drain_backoff: Duration,
    pub logs: Arc<LogSink>,
    pub refresh_tx: broadcast::Sender<()>,
}

impl SupervisorCtx {
    pub fn notify_refresh(&self) {
        let _ = self.refresh_tx.send(());
    }
}

/// Start a stopped server. Preconditions are checked in order, each
/// with its own error: free port, jar present, active config present
/// (file mode writes it from the store when missing), launch
/// executable present. The transition to running is optimistic: the
/// process handle exists and no immediate exit was observed; there is
/// no positive readiness probe.
pub async fn start(
    ctx: &Arc<SupervisorCtx>,
    handle: &Arc<ServerHandle>,
    server: &mut ManagedServer,
    mode: ApiMode,
) -> Result<(), SupervisorError> {
    if !probe::port_available(server.port).await {
        return Err(SupervisorError::PortUnavailable(server.port));
    }
    if !ctx.jar_path.is_file() {
        return Err(SupervisorError::BinaryMissing(ctx.jar_path.clone()));
    }

    let config_path = server
        .active_config_path(&ctx.active_config_path)
        .to_path_buf();
    if mode == ApiMode::File {
        if !config_path.exists() {
            persist::write_active_config(&config_path, &server.store.valid_routes())?;
        }
        if !config_path.exists() {
            return Err(SupervisorError::ConfigMissing(config_path));
        }
    }

    let java = resolve_executable(&server.java_path)
        .ok_or_else(|| SupervisorError::ExecutableMissing(server.java_path.clone()))?;

    let mut cmd = Command::new(&java);
    cmd.arg("-jar").arg(&ctx.jar_path);
    match mode {
        ApiMode::File => {
            cmd.arg(format!(
                "--{ROUTE_FILE_PROPERTY}=file:{}",
                config_path.display()
            ));
            cmd.arg(format!("--server.port={}", server.port));
        }
        ApiMode::Database => {
            cmd.arg(format!("--server.port={}", server.port));
            cmd.arg(format!(
                "--spring.profiles.active={}",
                ctx.database_profile
            ));
        }
    }

    let mut child = cmd
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(SupervisorError::Spawn)?;

    if let Some(stdout) = child.stdout.take() {
        spawn_log_pump(ctx.logs.clone(), server.name.clone(), LogStream::Stdout, stdout);
    }
    if let Some(stderr) = child.stderr.take() {
        spawn_log_pump(ctx.logs.clone(), server.name.clone(), LogStream::Stderr, stderr);
    }

    server.pid = child.id();
    server.child = Some(child);
    server.running = true;
    server.generation += 1;

    info!(
        server = %server.name,
        port = server.port,
        mode = %mode,
        pid = server.pid,
        "server started"
    );

    spawn_exit_monitor(ctx.clone(), handle.clone(), server.generation);
    ctx.notify_refresh();
    Ok(())
}

/// Request a stop. The local model transitions immediately (stop
/// requested); the exit monitor reconciles when the process actually
/// exits (stop confirmed). No-op when already stopped.
pub fn stop(ctx: &SupervisorCtx, server: &mut ManagedServer) {
    let Some(child) = server.child.as_mut() else {
        server.running = false;
        return;
    };
    if let Err(err) = child.start_kill() {
        warn!(server = %server.name, error = %err, "failed to signal server process");
    }
    server.running = false;
    info!(server = %server.name, "server stop requested");
    ctx.notify_refresh();
}

/// Stop, wait for the OS to release the port within the drain budget,
/// then start. On drain exhaustion the server stays stopped and the
/// failure is surfaced; there is no silent retry loop.
pub async fn restart(
    ctx: &Arc<SupervisorCtx>,
    handle: &Arc<ServerHandle>,
    server: &mut ManagedServer,
    mode: ApiMode,
) -> Result<(), SupervisorError> {
    if mode == ApiMode::File {
        let config_path = server
            .active_config_path(&ctx.active_config_path)
            .to_path_buf();
        persist::write_active_config(&config_path, &server.store.valid_routes())?;
    }

    if server.running {
        stop(ctx, server);
    }

    if !probe::wait_for_port_free(server.port, ctx.drain_attempts, ctx.drain_backoff).await {
        return Err(SupervisorError::DrainTimeout(server.port));
    }

    start(ctx, handle, server, mode).await
}

/// Validate and apply a port change. When the server is running a full
/// restart rebinds the child; if that restart fails the port rolls
/// back so the operation never leaves half-applied state.
pub async fn change_port(
    ctx: &Arc<SupervisorCtx>,
    handle: &Arc<ServerHandle>,
    server: &mut ManagedServer,
    new_port: u16,
    mode: ApiMode,
) -> Result<(), SupervisorError> {
    if !probe::port_available(new_port).await {
        return Err(SupervisorError::PortUnavailable(new_port));
    }

    let old_port = server.port;
    server.port = new_port;

    if server.running {
        if let Err(err) = restart(ctx, handle, server, mode).await {
            server.port = old_port;
            return Err(err);
        }
    }

    ctx.notify_refresh();
    Ok(())
}

/// Kill every live child. Called at daemon shutdown; the records are
/// not torn down, the session just ends.
pub async fn shutdown_all(ctx: &SupervisorCtx, handles: &[Arc<ServerHandle>]) {
    for handle in handles {
        let mut server = handle.lock().await;
        if server.child.is_some() {
            info!(server = %server.name, "shutting down server process");
            stop(ctx, &mut server);
            server.child = None;
            server.pid = None;
        }
    }
}

/// Resolve the launch executable: explicit paths must exist, bare
/// names go through `which`.
fn resolve_executable(java_path: &str) -> Option<PathBuf> {
    let path = Path::new(java_path);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }
    which_binary(java_path)
}

fn which_binary(name: &str) -> Option<PathBuf> {
    let output = std::process::Command::new("which").arg(name).output().ok()?;
    if output.status.success() {
        let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    None
}

fn spawn_log_pump<R>(logs: Arc<LogSink>, server: String, stream: LogStream, reader: R)
where
    R: tokio::io::AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.is_empty() {
                logs.publish(&server, stream, line);
            }
        }
        debug!(server, stream = stream.as_str(), "log stream closed");
    });
}

/// Poll the child until it exits, then reconcile: clear the handle,
/// flip `running`, log the exit code, fire a refresh. This is the only
/// path where `running` becomes false other than an explicit stop. A
/// generation mismatch means a newer child owns the slot and this
/// monitor retires without touching anything.
fn spawn_exit_monitor(ctx: Arc<SupervisorCtx>, handle: Arc<ServerHandle>, generation: u64) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_millis(MONITOR_POLL_MS)).await;
            let mut server = handle.lock().await;
            if server.generation != generation {
                return;
            }
            let Some(child) = server.child.as_mut() else {
                return;
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    let code = status
                        .code()
                        .map_or_else(|| "signal".to_string(), |c| c.to_string());
                    ctx.logs.publish(
                        &server.name,
                        LogStream::Supervisor,
                        format!("server exited with code {code}"),
                    );
                    server.child = None;
                    server.pid = None;
                    server.running = false;
                    ctx.notify_refresh();
                    return;
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(server = %server.name, error = %err, "exit monitor lost the child");
                    server.child = None;
                    server.pid = None;
                    server.running = false;
                    ctx.notify_refresh();
                    return;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Method, RouteDefinition};
    use crate::store::ManagedServer;

    use std::os::unix::fs::PermissionsExt;

    struct Fixture {
        _dir: tempfile::TempDir,
        ctx: Arc<SupervisorCtx>,
        java: String,
    }

    /// A stub launcher standing in for `java`: ignores its arguments
    /// and idles (or exits immediately with `sleep_secs == 0`).
    fn fixture(sleep_secs: u32) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");

        let jar = dir.path().join("mokkybuddy-api.jar");
        std::fs::write(&jar, b"stub jar").expect("write jar");

        let java = dir.path().join("fake-java");
        let script = if sleep_secs == 0 {
            "#!/bin/sh\nexit 0\n".to_string()
        } else {
            format!("#!/bin/sh\nsleep {sleep_secs}\n")
        };
        std::fs::write(&java, script).expect("write stub");
        let mut perms = std::fs::metadata(&java).expect("meta").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&java, perms).expect("chmod");

        let (refresh_tx, _) = broadcast::channel(32);
        let ctx = Arc::new(SupervisorCtx {
            jar_path: jar,
            active_config_path: dir.path().join("api-temp.json"),
            database_profile: "database".into(),
            drain_attempts: 3,
            drain_backoff: Duration::from_millis(50),
            logs: Arc::new(LogSink::new(64)),
            refresh_tx,
        });

        Fixture {
            java: java.to_string_lossy().into_owned(),
            _dir: dir,
            ctx,
        }
    }

    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        port
    }

    async fn wait_until_stopped(handle: &Arc<ServerHandle>) -> bool {
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let server = handle.lock().await;
            if !server.running && server.child.is_none() {
                return true;
            }
        }
        false
    }

    #[tokio::test]
    async fn start_transitions_to_running_and_writes_missing_config() {
        let fx = fixture(30);
        let mut server = ManagedServer::new("localhost", free_port().await, &fx.java);
        server.store.add(RouteDefinition::new(Method::GET, "/users"));
        let handle = ServerHandle::new(server);

        {
            let mut guard = handle.lock().await;
            start(&fx.ctx, &handle, &mut guard, ApiMode::File)
                .await
                .expect("start");
            assert!(guard.running);
            assert!(guard.child.is_some());
            stop(&fx.ctx, &mut guard);
        }

        let routes = persist::load_route_file(&fx.ctx.active_config_path).expect("active config");
        assert_eq!(routes.len(), 1);
        assert!(wait_until_stopped(&handle).await);
    }

    #[tokio::test]
    async fn exit_monitor_reconciles_self_exit() {
        let fx = fixture(0);
        let server = ManagedServer::new("localhost", free_port().await, &fx.java);
        let handle = ServerHandle::new(server);
        let mut refresh_rx = fx.ctx.refresh_tx.subscribe();

        {
            let mut guard = handle.lock().await;
            start(&fx.ctx, &handle, &mut guard, ApiMode::File)
                .await
                .expect("start");
            assert!(guard.running);
        }

        assert!(wait_until_stopped(&handle).await);
        assert!(refresh_rx.try_recv().is_ok() || refresh_rx.recv().await.is_ok());

        let tail = fx.ctx.logs.tail(16);
        assert!(tail
            .iter()
            .any(|e| e.stream == LogStream::Supervisor && e.line.contains("exited with code 0")));
    }

    #[tokio::test]
    async fn start_fails_on_bound_port() {
        let fx = fixture(30);
        let holder = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let port = holder.local_addr().expect("addr").port();

        let server = ManagedServer::new("localhost", port, &fx.java);
        let handle = ServerHandle::new(server);
        let mut guard = handle.lock().await;
        let err = start(&fx.ctx, &handle, &mut guard, ApiMode::File)
            .await
            .expect_err("must fail");
        assert!(matches!(err, SupervisorError::PortUnavailable(p) if p == port));
        assert!(!guard.running);
    }

    #[tokio::test]
    async fn start_fails_without_jar() {
        let fx = fixture(30);
        std::fs::remove_file(&fx.ctx.jar_path).expect("rm jar");

        let server = ManagedServer::new("localhost", free_port().await, &fx.java);
        let handle = ServerHandle::new(server);
        let mut guard = handle.lock().await;
        let err = start(&fx.ctx, &handle, &mut guard, ApiMode::File)
            .await
            .expect_err("must fail");
        assert!(matches!(err, SupervisorError::BinaryMissing(_)));
    }

    #[tokio::test]
    async fn start_fails_without_executable() {
        let fx = fixture(30);
        let server = ManagedServer::new("localhost", free_port().await, "/nonexistent/java");
        let handle = ServerHandle::new(server);
        let mut guard = handle.lock().await;
        let err = start(&fx.ctx, &handle, &mut guard, ApiMode::File)
            .await
            .expect_err("must fail");
        assert!(matches!(err, SupervisorError::ExecutableMissing(_)));
    }

    #[tokio::test]
    async fn restart_rewrites_config_and_comes_back_running() {
        let fx = fixture(30);
        let mut server = ManagedServer::new("localhost", free_port().await, &fx.java);
        server.store.add(RouteDefinition::new(Method::GET, "/users"));
        let handle = ServerHandle::new(server);

        {
            let mut guard = handle.lock().await;
            start(&fx.ctx, &handle, &mut guard, ApiMode::File)
                .await
                .expect("start");

            guard.store.add(RouteDefinition::new(Method::POST, "/users"));
            restart(&fx.ctx, &handle, &mut guard, ApiMode::File)
                .await
                .expect("restart");
            assert!(guard.running);

            let routes =
                persist::load_route_file(&fx.ctx.active_config_path).expect("active config");
            assert_eq!(routes, guard.store.valid_routes());

            stop(&fx.ctx, &mut guard);
        }
        assert!(wait_until_stopped(&handle).await);
    }

    #[tokio::test]
    async fn change_port_conflict_rolls_back_and_skips_restart() {
        let fx = fixture(30);
        let holder = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let taken = holder.local_addr().expect("addr").port();

        let original = free_port().await;
        let server = ManagedServer::new("localhost", original, &fx.java);
        let handle = ServerHandle::new(server);

        let mut guard = handle.lock().await;
        let err = change_port(&fx.ctx, &handle, &mut guard, taken, ApiMode::File)
            .await
            .expect_err("must fail");
        assert!(matches!(err, SupervisorError::PortUnavailable(p) if p == taken));
        assert_eq!(guard.port, original);
        assert!(!guard.running);
    }

    #[tokio::test]
    async fn change_port_while_running_restarts_on_new_port() {
        let fx = fixture(30);
        let server = ManagedServer::new("localhost", free_port().await, &fx.java);
        let handle = ServerHandle::new(server);

        {
            let mut guard = handle.lock().await;
            start(&fx.ctx, &handle, &mut guard, ApiMode::File)
                .await
                .expect("start");

            let new_port = free_port().await;
            change_port(&fx.ctx, &handle, &mut guard, new_port, ApiMode::File)
                .await
                .expect("change port");
            assert_eq!(guard.port, new_port);
            assert!(guard.running);
            stop(&fx.ctx, &mut guard);
        }
        assert!(wait_until_stopped(&handle).await);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let fx = fixture(30);
        let server = ManagedServer::new("localhost", free_port().await, &fx.java);
        let handle = ServerHandle::new(server);
        let mut guard = handle.lock().await;
        stop(&fx.ctx, &mut guard);
        assert!(!guard.running);
        stop(&fx.ctx, &mut guard);
        assert!(!guard.running);
    }
}
