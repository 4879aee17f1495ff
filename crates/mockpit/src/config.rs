use std::env;
use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

fn xdg_state_home() -> PathBuf {
    env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".local/state")
        })
}

fn xdg_config_home() -> PathBuf {
    env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".config")
        })
}

fn xdg_data_home() -> PathBuf {
    env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
            PathBuf::from(home).join(".local/share")
        })
}

fn xdg_runtime_dir() -> PathBuf {
    if let Ok(dir) = env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = env::var("TMPDIR") {
        return PathBuf::from(dir);
    }
    PathBuf::from("/tmp")
}

#[derive(Debug, Clone)]
pub struct MockpitConfig {
    /// Holds the UI snapshot, the active config document, and the
    /// settings document.
    pub state_dir: PathBuf,
    pub runtime_dir: PathBuf,
    pub control_socket: PathBuf,
    /// The bundled mock-server jar.
    pub jar_path: PathBuf,
    pub java_path: String,
    pub server_name: String,
    pub server_port: u16,
    /// Spring profile selecting the jar's persistent backend in
    /// database mode.
    pub database_profile: String,
    pub drain_attempts: u32,
    pub drain_backoff_ms: u64,
}

impl Default for MockpitConfig {
    fn default() -> Self {
        let state_dir = xdg_state_home().join("mockpit");
        let runtime_dir = xdg_runtime_dir().join("mockpit");
        Self {
            control_socket: runtime_dir.join("mockpit.sock"),
            jar_path: xdg_data_home().join("mockpit/mokkybuddy-api.jar"),
            java_path: "java".to_string(),
            server_name: "localhost".to_string(),
            server_port: 8081,
            database_profile: "database".to_string(),
            drain_attempts: 5,
            drain_backoff_ms: 500,
            state_dir,
            runtime_dir,
        }
    }
}

impl MockpitConfig {
    pub fn load() -> anyhow::Result<Self> {
        let mut cfg = Self::default();

        // Layer 2: TOML config file (overrides defaults)
        let file = ConfigFile::load();
        if let Some(ref v) = file.state_dir {
            cfg.state_dir = expand_tilde(v);
        }
        if let Some(ref v) = file.runtime_dir {
            cfg.runtime_dir = expand_tilde(v);
            if file.control_socket.is_none() {
                cfg.control_socket = cfg.runtime_dir.join("mockpit.sock");
            }
        }
        if let Some(ref v) = file.control_socket {
            cfg.control_socket = expand_tilde(v);
        }
        if let Some(ref v) = file.jar_path {
            cfg.jar_path = expand_tilde(v);
        }
        if let Some(ref v) = file.java_path {
            cfg.java_path = v.clone();
        }
        if let Some(ref v) = file.server_name {
            cfg.server_name = v.clone();
        }
        if let Some(v) = file.server_port {
            cfg.server_port = v;
        }
        if let Some(ref v) = file.database_profile {
            cfg.database_profile = v.clone();
        }
        if let Some(v) = file.drain_attempts {
            cfg.drain_attempts = v;
        }
        if let Some(v) = file.drain_backoff_ms {
            cfg.drain_backoff_ms = v;
        }

        // Layer 3: Environment variables (highest priority)
        if let Ok(path) = env::var("MOCKPIT_STATE_DIR") {
            cfg.state_dir = PathBuf::from(path);
        }
        if let Ok(path) = env::var("MOCKPIT_RUNTIME_DIR") {
            cfg.runtime_dir = PathBuf::from(&path);
            if env::var("MOCKPIT_CONTROL_SOCKET").is_err() && file.control_socket.is_none() {
                cfg.control_socket = cfg.runtime_dir.join("mockpit.sock");
            }
        }
        if let Ok(path) = env::var("MOCKPIT_CONTROL_SOCKET") {
            cfg.control_socket = PathBuf::from(path);
        }
        if let Ok(path) = env::var("MOCKPIT_JAR_PATH") {
            cfg.jar_path = PathBuf::from(path);
        }
        if let Ok(path) = env::var("MOCKPIT_JAVA_PATH") {
            cfg.java_path = path;
        }
        if let Ok(name) = env::var("MOCKPIT_SERVER_NAME") {
            cfg.server_name = name;
        }
        if let Ok(raw) = env::var("MOCKPIT_SERVER_PORT") {
            cfg.server_port = raw
                .parse()
                .with_context(|| format!("invalid MOCKPIT_SERVER_PORT: {raw}"))?;
        }
        if let Ok(profile) = env::var("MOCKPIT_DATABASE_PROFILE") {
            cfg.database_profile = profile;
        }

        Ok(cfg)
    }

    pub fn ui_snapshot_path(&self) -> PathBuf {
        self.state_dir.join("api-ui.json")
    }

    pub fn active_config_path(&self) -> PathBuf {
        self.state_dir.join("api-temp.json")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.state_dir.join("settings.json")
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(rest)
    } else {
        PathBuf::from(path)
    }
}

#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    state_dir: Option<String>,
    runtime_dir: Option<String>,
    control_socket: Option<String>,
    jar_path: Option<String>,
    java_path: Option<String>,
    server_name: Option<String>,
    server_port: Option<u16>,
    database_profile: Option<String>,
    drain_attempts: Option<u32>,
    drain_backoff_ms: Option<u64>,
}

impl ConfigFile {
    fn load() -> Self {
        let path = xdg_config_home().join("mockpit/config.toml");
        let Ok(content) = std::fs::read_to_string(&path) else {
            return Self::default();
        };
        match toml::from_str(&content) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::warn!("failed to parse {}: {e}", path.display());
                Self::default()
            }
        }
    }
}
