use std::fs;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use crate::config::MockpitConfig;

pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn ensure_runtime_paths(cfg: &MockpitConfig) -> anyhow::Result<()> {
    fs::create_dir_all(&cfg.state_dir)
        .with_context(|| format!("failed to create state dir: {}", cfg.state_dir.display()))?;

    if let Some(parent) = cfg.control_socket.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("failed to create control socket dir: {}", parent.display())
        })?;
    }
    if cfg.control_socket.exists() {
        fs::remove_file(&cfg.control_socket).with_context(|| {
            format!(
                "failed to remove stale control socket: {}",
                cfg.control_socket.display()
            )
        })?;
    }

    Ok(())
}

pub async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => { tracing::info!("received SIGTERM, shutting down"); }
        _ = sigint.recv() => { tracing::info!("received SIGINT, shutting down"); }
    }
}
