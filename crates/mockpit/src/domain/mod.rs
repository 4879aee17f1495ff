use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    GET,
    POST,
    PUT,
    DELETE,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GET => "GET",
            Self::POST => "POST",
            Self::PUT => "PUT",
            Self::DELETE => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("invalid method: {0}, must be GET/POST/PUT/DELETE")]
pub struct MethodParseError(String);

impl FromStr for Method {
    type Err = MethodParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::GET),
            "POST" => Ok(Self::POST),
            "PUT" => Ok(Self::PUT),
            "DELETE" => Ok(Self::DELETE),
            other => Err(MethodParseError(other.to_string())),
        }
    }
}

/// One mocked endpoint. `method` and `path` are optional on the wire
/// because loaded documents may carry incomplete entries; such entries
/// are kept in the store but filtered from every rendered or persisted
/// view (see [`RouteDefinition::is_valid`]).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDefinition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_body: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_schema: Option<Value>,
    /// Server-issued identity, populated only in database mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl RouteDefinition {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method: Some(method),
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// A route is renderable and persistable only with both a method
    /// and a non-empty path starting with `/`.
    pub fn is_valid(&self) -> bool {
        self.method.is_some()
            && self
                .path
                .as_deref()
                .is_some_and(|p| !p.is_empty() && p.starts_with('/'))
    }

    /// Key used for matching when no server-issued id exists.
    pub fn key(&self) -> Option<(Method, &str)> {
        Some((self.method?, self.path.as_deref()?))
    }
}

/// How a route to delete is identified: by (method, path) in file
/// mode, by server-issued id in database mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteMatcher {
    Key { method: Method, path: String },
    Id(String),
}

impl RouteMatcher {
    pub fn matches(&self, route: &RouteDefinition) -> bool {
        match self {
            Self::Key { method, path } => {
                route.method == Some(*method) && route.path.as_deref() == Some(path.as_str())
            }
            Self::Id(id) => route.id.as_deref() == Some(id.as_str()),
        }
    }
}

impl fmt::Display for RouteMatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Key { method, path } => write!(f, "[{method}] {path}"),
            Self::Id(id) => write!(f, "id {id}"),
        }
    }
}

/// Which backend owns the route set: a JSON document read by the
/// spawned process at startup, or the process's own store managed over
/// its HTTP API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiMode {
    #[default]
    File,
    Database,
}

impl ApiMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Database => "database",
        }
    }
}

impl fmt::Display for ApiMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "file" => Ok(Self::File),
            "database" | "db" => Ok(Self::Database),
            other => Err(format!("invalid mode: {other}, must be file/database")),
        }
    }
}

/// One element of the UI snapshot document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerSummary {
    pub name: String,
    pub port: u16,
    pub java_path: String,
    #[serde(default)]
    pub api_list: Vec<RouteDefinition>,
}
