use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info};

use crate::domain::{ApiMode, Method, RouteMatcher};
use crate::service::{self, ServiceError};
use crate::SharedState;

#[derive(Debug, Deserialize)]
struct RequestEnvelope {
    request_id: String,
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ResponseEnvelope {
    request_id: String,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ServerParams {
    #[serde(default)]
    server: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChangePortParams {
    #[serde(default)]
    server: Option<String>,
    port: u16,
}

#[derive(Debug, Deserialize)]
struct AddRouteParams {
    #[serde(default)]
    server: Option<String>,
    method: String,
    path: String,
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    expected_body: Option<String>,
    #[serde(default)]
    json_schema: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteRouteParams {
    #[serde(default)]
    server: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoadConfigParams {
    #[serde(default)]
    server: Option<String>,
    path: String,
}

#[derive(Debug, Deserialize)]
struct SelectModeParams {
    mode: String,
}

#[derive(Debug, Deserialize)]
struct LogsTailParams {
    #[serde(default = "default_tail")]
    lines: usize,
}

fn default_tail() -> usize {
    50
}

pub async fn run_control_server(socket_path: PathBuf, state: SharedState) -> anyhow::Result<()> {
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(&socket_path)?;
    info!(path = %socket_path.display(), "control server listening");

    loop {
        let (stream, _) = listener.accept().await?;
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_client(stream, state).await {
                let is_broken_pipe = err
                    .downcast_ref::<std::io::Error>()
                    .is_some_and(|e| e.kind() == std::io::ErrorKind::BrokenPipe);
                if is_broken_pipe {
                    debug!(error = %err, "control client disconnected");
                } else {
                    error!(error = %err, "control client failed");
                }
            }
        });
    }
}

async fn handle_client(stream: UnixStream, state: SharedState) -> anyhow::Result<()> {
    let (r, mut w) = stream.into_split();
    let mut reader = BufReader::new(r).lines();

    while let Some(line) = reader.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let response = match serde_json::from_str::<RequestEnvelope>(&line) {
            Ok(req) => dispatch_request(req, &state).await,
            Err(err) => ResponseEnvelope {
                request_id: "unknown".to_string(),
                ok: false,
                result: None,
                error: Some(ErrorBody {
                    code: "bad_request".to_string(),
                    message: err.to_string(),
                }),
            },
        };

        let payload = serde_json::to_string(&response)?;
        w.write_all(payload.as_bytes()).await?;
        w.write_all(b"\n").await?;
    }

    Ok(())
}

macro_rules! parse_params {
    ($req:ident) => {
        match serde_json::from_value($req.params) {
            Ok(v) => v,
            Err(e) => {
                return render_err(
                    $req.request_id,
                    &ServiceError::InvalidParams(e.to_string()),
                );
            }
        }
    };
}

async fn dispatch_request(req: RequestEnvelope, state: &SharedState) -> ResponseEnvelope {
    let result = match req.method.as_str() {
        "health.ping" => Ok(json!({ "pong": true })),
        "server.list" => {
            let servers = service::list_servers(state).await;
            let mode = service::current_mode(state);
            Ok(json!({ "servers": servers, "mode": mode.to_string() }))
        }
        "server.toggle" => {
            let params: ServerParams = parse_params!(req);
            match service::toggle_server(state, params.server.as_deref()).await {
                Ok(running) => Ok(json!({ "running": running })),
                Err(e) => Err(e),
            }
        }
        "server.port" => {
            let params: ChangePortParams = parse_params!(req);
            if params.port == 0 {
                return render_err(
                    req.request_id,
                    &ServiceError::InvalidParams("port must be > 0".to_string()),
                );
            }
            match service::change_port(state, params.server.as_deref(), params.port).await {
                Ok(()) => Ok(json!({ "port": params.port })),
                Err(e) => Err(e),
            }
        }
        "route.list" => {
            let params: ServerParams = parse_params!(req);
            match service::list_routes(state, params.server.as_deref()).await {
                Ok(routes) => Ok(json!({ "routes": routes })),
                Err(e) => Err(e),
            }
        }
        "route.add" => {
            let params: AddRouteParams = parse_params!(req);
            let method: Method = match params.method.parse() {
                Ok(m) => m,
                Err(e) => {
                    return render_err(
                        req.request_id,
                        &ServiceError::InvalidParams(e.to_string()),
                    );
                }
            };
            match service::add_route(
                state,
                params.server.as_deref(),
                method,
                params.path,
                params.response.as_deref(),
                params.expected_body.as_deref(),
                params.json_schema.as_deref(),
            )
            .await
            {
                Ok(outcome) => Ok(json!({
                    "route": outcome.route,
                    "warnings": outcome.warnings,
                })),
                Err(e) => Err(e),
            }
        }
        "route.delete" => {
            let params: DeleteRouteParams = parse_params!(req);
            let matcher = match build_matcher(&params) {
                Ok(m) => m,
                Err(e) => return render_err(req.request_id, &e),
            };
            match service::delete_route(state, params.server.as_deref(), matcher).await {
                Ok(removed) => Ok(json!({ "removed": removed })),
                Err(e) => Err(e),
            }
        }
        "config.save" => {
            let params: ServerParams = parse_params!(req);
            match service::save_config(state, params.server.as_deref()).await {
                Ok(()) => Ok(json!({ "saved": true })),
                Err(e) => Err(e),
            }
        }
        "config.load" => {
            let params: LoadConfigParams = parse_params!(req);
            let path = std::path::PathBuf::from(&params.path);
            match service::load_config(state, params.server.as_deref(), &path).await {
                Ok(count) => Ok(json!({ "loaded": count })),
                Err(e) => Err(e),
            }
        }
        "mode.get" => {
            let mode = service::current_mode(state);
            Ok(json!({ "mode": mode.to_string() }))
        }
        "mode.select" => {
            let params: SelectModeParams = parse_params!(req);
            let mode: ApiMode = match params.mode.parse() {
                Ok(m) => m,
                Err(e) => {
                    return render_err(
                        req.request_id,
                        &ServiceError::InvalidParams(e.to_string()),
                    );
                }
            };
            match service::select_mode(state, mode).await {
                Ok(()) => Ok(json!({ "mode": mode.to_string() })),
                Err(e) => Err(e),
            }
        }
        "logs.tail" => {
            let params: LogsTailParams = parse_params!(req);
            let events = state.supervisor.logs.tail(params.lines);
            Ok(json!({ "events": events }))
        }
        _ => Err(ServiceError::InvalidParams(format!(
            "unknown method: {}",
            req.method
        ))),
    };

    match result {
        Ok(result) => ResponseEnvelope {
            request_id: req.request_id,
            ok: true,
            result: Some(result),
            error: None,
        },
        Err(err) => render_err(req.request_id, &err),
    }
}

/// An id takes precedence; otherwise both method and path must be
/// present to form a key matcher.
fn build_matcher(params: &DeleteRouteParams) -> Result<RouteMatcher, ServiceError> {
    if let Some(id) = &params.id {
        return Ok(RouteMatcher::Id(id.clone()));
    }
    match (&params.method, &params.path) {
        (Some(method), Some(path)) => {
            let method: Method = method
                .parse()
                .map_err(|e: crate::domain::MethodParseError| {
                    ServiceError::InvalidParams(e.to_string())
                })?;
            Ok(RouteMatcher::Key {
                method,
                path: path.clone(),
            })
        }
        _ => Err(ServiceError::InvalidParams(
            "either id or method+path is required".to_string(),
        )),
    }
}

fn render_err(request_id: String, err: &ServiceError) -> ResponseEnvelope {
    ResponseEnvelope {
        request_id,
        ok: false,
        result: None,
        error: Some(ErrorBody {
            code: err.code().to_string(),
            message: err.to_string(),
        }),
    }
}
