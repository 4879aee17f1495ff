use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::{ApiMode, RouteDefinition, ServerSummary};

/// UI snapshot document: last-known state of every managed server.
/// This is a cache for the next session, deliberately distinct from
/// the active document the spawned process actually reads.
pub fn write_ui_snapshot(path: &Path, servers: &[ServerSummary]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create snapshot dir: {}", parent.display()))?;
    }
    let raw = serde_json::to_vec_pretty(servers)?;
    fs::write(path, raw).with_context(|| format!("failed writing {}", path.display()))?;
    Ok(())
}

/// Absent file is a normal first run, not an error. Anything that does
/// not decode to an array is rejected wholesale so the caller keeps
/// its current state.
pub fn load_ui_snapshot(path: &Path) -> anyhow::Result<Option<Vec<ServerSummary>>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_slice(&raw)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    if !value.is_array() {
        anyhow::bail!("{} does not contain a server list", path.display());
    }
    let servers: Vec<ServerSummary> = serde_json::from_value(value)
        .with_context(|| format!("invalid server list in {}", path.display()))?;
    Ok(Some(servers))
}

/// Active config document: the bare route array the spawned process
/// reads at launch. Written before every file-mode restart.
pub fn write_active_config(path: &Path, routes: &[RouteDefinition]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create config dir: {}", parent.display()))?;
    }
    let raw = serde_json::to_vec_pretty(routes)?;
    fs::write(path, raw).with_context(|| format!("failed writing {}", path.display()))?;
    Ok(())
}

/// Load a route document (active config or user-picked external file).
/// All-or-nothing: a document that is not an array fails without
/// touching the caller's route store.
pub fn load_route_file(path: &Path) -> anyhow::Result<Vec<RouteDefinition>> {
    let raw = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let value: serde_json::Value = serde_json::from_slice(&raw)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    if !value.is_array() {
        anyhow::bail!("{} does not contain a route list", path.display());
    }
    let routes: Vec<RouteDefinition> = serde_json::from_value(value)
        .with_context(|| format!("invalid route list in {}", path.display()))?;
    Ok(routes)
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Settings {
    #[serde(default)]
    api_mode: ApiMode,
}

/// The persisted mode is read fresh at the start of every mutating
/// operation; it can change between calls. Unreadable settings fall
/// back to file mode.
pub fn read_mode(path: &Path) -> ApiMode {
    let Ok(raw) = fs::read(path) else {
        return ApiMode::File;
    };
    match serde_json::from_slice::<Settings>(&raw) {
        Ok(settings) => settings.api_mode,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "unreadable settings, assuming file mode");
            ApiMode::File
        }
    }
}

pub fn write_mode(path: &Path, mode: ApiMode) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create settings dir: {}", parent.display()))?;
    }
    let raw = serde_json::to_vec_pretty(&Settings { api_mode: mode })?;
    fs::write(path, raw).with_context(|| format!("failed writing {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Method;

    #[test]
    fn snapshot_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("api-ui.json");

        let servers = vec![ServerSummary {
            name: "localhost".into(),
            port: 8081,
            java_path: "java".into(),
            api_list: vec![RouteDefinition::new(Method::GET, "/users")],
        }];
        write_ui_snapshot(&path, &servers).expect("write");

        let loaded = load_ui_snapshot(&path).expect("load").expect("present");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "localhost");
        assert_eq!(loaded[0].api_list.len(), 1);
    }

    #[test]
    fn absent_snapshot_is_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let loaded = load_ui_snapshot(&dir.path().join("missing.json")).expect("load");
        assert!(loaded.is_none());
    }

    #[test]
    fn non_array_snapshot_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("api-ui.json");
        fs::write(&path, r#"{"name":"localhost"}"#).expect("write");
        assert!(load_ui_snapshot(&path).is_err());
    }

    #[test]
    fn active_config_is_a_bare_route_array() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("api-temp.json");

        let mut route = RouteDefinition::new(Method::GET, "/users");
        route.response = Some(serde_json::json!({"ok": true}));
        write_active_config(&path, &[route]).expect("write");

        let raw = fs::read_to_string(&path).expect("read");
        let value: serde_json::Value = serde_json::from_str(&raw).expect("parse");
        assert_eq!(
            value,
            serde_json::json!([{"method": "GET", "path": "/users", "response": {"ok": true}}])
        );
    }

    #[test]
    fn route_file_must_be_an_array() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("routes.json");
        fs::write(&path, r#"{"method":"GET"}"#).expect("write");
        assert!(load_route_file(&path).is_err());

        fs::write(&path, "not json at all").expect("write");
        assert!(load_route_file(&path).is_err());

        fs::write(&path, r#"[{"method":"GET","path":"/a"}]"#).expect("write");
        let routes = load_route_file(&path).expect("load");
        assert_eq!(routes.len(), 1);
    }

    #[test]
    fn mode_defaults_to_file_and_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");

        assert_eq!(read_mode(&path), ApiMode::File);

        write_mode(&path, ApiMode::Database).expect("write");
        assert_eq!(read_mode(&path), ApiMode::Database);

        fs::write(&path, "garbage").expect("write");
        assert_eq!(read_mode(&path), ApiMode::File);
    }
}
