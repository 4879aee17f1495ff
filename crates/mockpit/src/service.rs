use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::domain::{ApiMode, Method, RouteDefinition, RouteMatcher};
use crate::persist;
use crate::process::{self, SupervisorError};
use crate::remote::RouteApiClient;
use crate::store::{ManagedServer, ServerHandle};
use crate::SharedState;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("server not found: {0}")]
    NotFound(String),
    #[error("port {0} already in use")]
    PortUnavailable(u16),
    #[error("server jar not found: {0}")]
    BinaryMissing(String),
    #[error("java executable not found: {0}")]
    ExecutableMissing(String),
    #[error("port {0} did not free up after stop")]
    DrainTimeout(u16),
    #[error("config I/O failed: {0}")]
    ConfigIo(String),
    #[error("invalid JSON: {0}")]
    MalformedJson(String),
    #[error("remote route API failed: {0}")]
    RemoteApi(String),
    #[error("invalid params: {0}")]
    InvalidParams(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::PortUnavailable(_) => "port_unavailable",
            Self::BinaryMissing(_) => "binary_missing",
            Self::ExecutableMissing(_) => "executable_missing",
            Self::DrainTimeout(_) => "drain_timeout",
            Self::ConfigIo(_) => "config_io",
            Self::MalformedJson(_) => "malformed_json",
            Self::RemoteApi(_) => "remote_api",
            Self::InvalidParams(_) => "invalid_params",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<SupervisorError> for ServiceError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::PortUnavailable(p) => Self::PortUnavailable(p),
            SupervisorError::BinaryMissing(p) => Self::BinaryMissing(p.display().to_string()),
            SupervisorError::ConfigMissing(p) => Self::ConfigIo(format!(
                "active config not found: {}",
                p.display()
            )),
            SupervisorError::ExecutableMissing(p) => Self::ExecutableMissing(p),
            SupervisorError::DrainTimeout(p) => Self::DrainTimeout(p),
            SupervisorError::Io(e) => Self::ConfigIo(e.to_string()),
            SupervisorError::Spawn(e) => Self::Internal(e.to_string()),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ServerStatus {
    pub name: String,
    pub port: u16,
    pub running: bool,
    pub pid: Option<u32>,
    /// Count after the validity filter, as rendered to the user.
    pub route_count: usize,
    pub external_config: Option<String>,
}

/// Outcome of an `add_route` intent: the stored route plus warnings
/// for any optional JSON field that was dropped as malformed.
#[derive(Debug, Serialize)]
pub struct AddRouteOutcome {
    pub route: RouteDefinition,
    pub warnings: Vec<String>,
}

/// The persisted mode is re-read at the start of every mutating
/// operation; it may change between calls and must not be cached.
pub fn current_mode(state: &SharedState) -> ApiMode {
    persist::read_mode(&state.settings_path)
}

fn resolve(state: &SharedState, name: Option<&str>) -> Result<Arc<ServerHandle>, ServiceError> {
    match name {
        Some(n) => state
            .registry
            .get(n)
            .ok_or_else(|| ServiceError::NotFound(n.to_string())),
        None => {
            let handles = state.registry.handles();
            match handles.as_slice() {
                [only] => Ok(only.clone()),
                _ => Err(ServiceError::InvalidParams(
                    "server name required when more than one server is managed".into(),
                )),
            }
        }
    }
}

/// UI snapshot covering every managed server, built from the
/// per-handle summary caches. Never takes another server's mutex
/// while the caller holds one; that ordering would deadlock two
/// concurrent mutations on different servers.
fn persist_snapshot_with(
    state: &SharedState,
    handle: &ServerHandle,
    locked: &ManagedServer,
    warnings: &mut Vec<String>,
) {
    handle.publish_summary(locked);
    let summaries = state.registry.cached_summaries();
    if let Err(err) = persist::write_ui_snapshot(&state.ui_snapshot_path, &summaries) {
        // The in-memory mutation stands; disk is now stale and the
        // caller must surface that, not swallow it.
        warn!(error = %err, "UI snapshot write failed, state and disk diverge");
        warnings.push(format!("UI snapshot write failed: {err}"));
    }
}

pub async fn list_servers(state: &SharedState) -> Vec<ServerStatus> {
    let mut out = Vec::new();
    for handle in state.registry.handles() {
        let server = handle.lock().await;
        out.push(ServerStatus {
            name: server.name.clone(),
            port: server.port,
            running: server.running,
            pid: server.pid,
            route_count: server.store.valid_count(),
            external_config: server
                .external_config_path
                .as_ref()
                .map(|p| p.display().to_string()),
        });
    }
    out
}

/// Valid-filtered route list for rendering.
pub async fn list_routes(
    state: &SharedState,
    name: Option<&str>,
) -> Result<Vec<RouteDefinition>, ServiceError> {
    let handle = resolve(state, name)?;
    let server = handle.lock().await;
    Ok(server.store.valid_routes())
}

/// Start the server when stopped, stop it when running. Returns the
/// resulting running flag.
pub async fn toggle_server(state: &SharedState, name: Option<&str>) -> Result<bool, ServiceError> {
    let mode = current_mode(state);
    let handle = resolve(state, name)?;
    let mut server = handle.lock().await;

    if server.running {
        process::stop(&state.supervisor, &mut server);
        info!(server = %server.name, "server stopped");
        return Ok(false);
    }

    process::start(&state.supervisor, &handle, &mut server, mode).await?;
    Ok(true)
}

pub async fn change_port(
    state: &SharedState,
    name: Option<&str>,
    new_port: u16,
) -> Result<(), ServiceError> {
    let mode = current_mode(state);
    let handle = resolve(state, name)?;
    let mut server = handle.lock().await;

    process::change_port(&state.supervisor, &handle, &mut server, new_port, mode).await?;

    let mut warnings = Vec::new();
    persist_snapshot_with(state, &handle, &server, &mut warnings);
    Ok(())
}

fn parse_optional_json(
    field: &str,
    raw: Option<&str>,
    warnings: &mut Vec<String>,
) -> Option<Value> {
    let raw = raw?.trim();
    if raw.is_empty() {
        return None;
    }
    match serde_json::from_str(raw) {
        Ok(value) => Some(value),
        Err(err) => {
            // Malformed optional fields are dropped with a warning;
            // route creation itself proceeds.
            warn!(field, error = %err, "ignoring malformed JSON field");
            warnings.push(format!("{field} is not valid JSON and was ignored"));
            None
        }
    }
}

pub async fn add_route(
    state: &SharedState,
    name: Option<&str>,
    method: Method,
    path: String,
    response: Option<&str>,
    expected_body: Option<&str>,
    json_schema: Option<&str>,
) -> Result<AddRouteOutcome, ServiceError> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(ServiceError::InvalidParams(format!(
            "path must start with /: {path}"
        )));
    }

    let mode = current_mode(state);
    let handle = resolve(state, name)?;
    let mut server = handle.lock().await;

    let mut warnings = Vec::new();
    let mut route = RouteDefinition::new(method, path);
    route.response = parse_optional_json("response", response, &mut warnings);
    route.expected_body = parse_optional_json("expected body", expected_body, &mut warnings);
    route.json_schema = parse_optional_json("JSON schema", json_schema, &mut warnings);

    match mode {
        ApiMode::File => {
            server.store.add(route.clone());
            if server.running {
                process::restart(&state.supervisor, &handle, &mut server, mode).await?;
            } else {
                let config_path = server
                    .active_config_path(&state.supervisor.active_config_path)
                    .to_path_buf();
                if let Err(err) =
                    persist::write_active_config(&config_path, &server.store.valid_routes())
                {
                    warn!(error = %err, "active config write failed");
                    warnings.push(format!("active config write failed: {err}"));
                }
            }
        }
        ApiMode::Database => {
            // Never insert unconfirmed routes: the remote store is
            // authoritative and issues the id.
            let client = RouteApiClient::new(server.port);
            let id = client
                .create_route(&route)
                .await
                .map_err(|e| ServiceError::RemoteApi(e.to_string()))?;
            route.id = Some(id);
            server.store.add(route.clone());
        }
    }

    persist_snapshot_with(state, &handle, &server, &mut warnings);
    state.supervisor.notify_refresh();
    info!(server = %server.name, route = %route_label(&route), "route added");
    Ok(AddRouteOutcome { route, warnings })
}

fn route_label(route: &RouteDefinition) -> String {
    match route.key() {
        Some((method, path)) => format!("[{method}] {path}"),
        None => "<incomplete>".to_string(),
    }
}

/// Delete routes the matcher accepts. Deleting an absent route is a
/// no-op, not a failure; the count of removed entries is returned.
pub async fn delete_route(
    state: &SharedState,
    name: Option<&str>,
    matcher: RouteMatcher,
) -> Result<usize, ServiceError> {
    let mode = current_mode(state);
    let handle = resolve(state, name)?;
    let mut server = handle.lock().await;

    let removed = match mode {
        ApiMode::File => {
            let removed = server.store.remove(&matcher);
            if removed > 0 && server.running {
                process::restart(&state.supervisor, &handle, &mut server, mode).await?;
            } else if removed > 0 {
                let config_path = server
                    .active_config_path(&state.supervisor.active_config_path)
                    .to_path_buf();
                // Same policy as add: the store mutation stands and
                // the stale document is surfaced, not fatal.
                if let Err(err) =
                    persist::write_active_config(&config_path, &server.store.valid_routes())
                {
                    warn!(error = %err, "active config write failed");
                }
            }
            removed
        }
        ApiMode::Database => {
            // Identity is authoritative in database mode; a key-based
            // matcher is resolved against the local store first.
            let id = match &matcher {
                RouteMatcher::Id(id) => Some(id.clone()),
                RouteMatcher::Key { .. } => server
                    .store
                    .routes()
                    .iter()
                    .find(|r| matcher.matches(r))
                    .and_then(|r| r.id.clone()),
            };
            let Some(id) = id else {
                return Ok(0);
            };
            let client = RouteApiClient::new(server.port);
            client
                .delete_route(&id)
                .await
                .map_err(|e| ServiceError::RemoteApi(e.to_string()))?;
            // Local removal only after the remote confirmed.
            server.store.remove(&RouteMatcher::Id(id))
        }
    };

    if removed > 0 {
        let mut warnings = Vec::new();
        persist_snapshot_with(state, &handle, &server, &mut warnings);
        state.supervisor.notify_refresh();
        info!(server = %server.name, matcher = %matcher, removed, "route deleted");
    }
    Ok(removed)
}

/// Explicit save: active document plus UI snapshot. Unlike the
/// implicit persistence after mutations, a failed write here fails
/// the whole intent.
pub async fn save_config(state: &SharedState, name: Option<&str>) -> Result<(), ServiceError> {
    let mode = current_mode(state);
    let handle = resolve(state, name)?;
    let server = handle.lock().await;

    if mode == ApiMode::File {
        let config_path = server
            .active_config_path(&state.supervisor.active_config_path)
            .to_path_buf();
        persist::write_active_config(&config_path, &server.store.valid_routes())
            .map_err(|e| ServiceError::ConfigIo(e.to_string()))?;
    }

    handle.publish_summary(&server);
    persist::write_ui_snapshot(&state.ui_snapshot_path, &state.registry.cached_summaries())
        .map_err(|e| ServiceError::ConfigIo(e.to_string()))?;
    Ok(())
}

/// Load a route document. All-or-nothing: a rejected file leaves the
/// current store untouched. In file mode the picked file becomes the
/// server's external config source; in database mode its contents are
/// bulk-imported into the remote store.
pub async fn load_config(
    state: &SharedState,
    name: Option<&str>,
    path: &Path,
) -> Result<usize, ServiceError> {
    let mode = current_mode(state);
    let handle = resolve(state, name)?;
    let mut server = handle.lock().await;

    let count = match mode {
        ApiMode::File => {
            let routes =
                persist::load_route_file(path).map_err(|e| ServiceError::ConfigIo(e.to_string()))?;
            let count = routes.len();
            server.store.replace_all(routes);
            server.external_config_path = Some(path.to_path_buf());
            if server.running {
                process::restart(&state.supervisor, &handle, &mut server, mode).await?;
            }
            count
        }
        ApiMode::Database => {
            let client = RouteApiClient::new(server.port);
            client
                .load_bulk(path)
                .await
                .map_err(|e| ServiceError::RemoteApi(e.to_string()))?;
            let routes = client.list_routes().await;
            let count = routes.len();
            server.store.replace_all(routes);
            count
        }
    };

    let mut warnings = Vec::new();
    persist_snapshot_with(state, &handle, &server, &mut warnings);
    state.supervisor.notify_refresh();
    info!(server = %server.name, path = %path.display(), count, "config loaded");
    Ok(count)
}

/// Switch configuration backends. A live process cannot hot-swap its
/// route source, so every running server is stopped first; then the
/// mode is persisted and every route store is invalidated and reloaded
/// from the new mode's source of truth.
pub async fn select_mode(state: &SharedState, new_mode: ApiMode) -> Result<(), ServiceError> {
    for handle in state.registry.handles() {
        let mut server = handle.lock().await;
        if server.running {
            process::stop(&state.supervisor, &mut server);
        }
    }

    persist::write_mode(&state.settings_path, new_mode)
        .map_err(|e| ServiceError::ConfigIo(e.to_string()))?;

    let snapshot = persist::load_ui_snapshot(&state.ui_snapshot_path).unwrap_or_else(|err| {
        warn!(error = %err, "unreadable UI snapshot during mode switch");
        None
    });

    for handle in state.registry.handles() {
        let mut server = handle.lock().await;
        let routes = match new_mode {
            ApiMode::File => match &server.external_config_path {
                Some(path) => persist::load_route_file(path).unwrap_or_else(|err| {
                    warn!(error = %err, "external config unreadable during mode switch");
                    Vec::new()
                }),
                None => snapshot
                    .as_ref()
                    .and_then(|servers| servers.iter().find(|s| s.name == server.name))
                    .map(|s| s.api_list.clone())
                    .unwrap_or_default(),
            },
            // Yields empty when the managed server is not running;
            // that is the correct "unknown, assume none" answer.
            ApiMode::Database => RouteApiClient::new(server.port).list_routes().await,
        };
        server.store.replace_all(routes);
        handle.publish_summary(&server);
    }

    state.supervisor.notify_refresh();
    info!(mode = %new_mode, "mode switched");
    Ok(())
}

/// Read-only render of a JSON value; no state change.
pub fn preview_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
