use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde_json::Value;
use tracing::warn;

use crate::domain::RouteDefinition;

/// Thin client for the spawned server's own route-management API,
/// used only in database mode. All calls target the managed server's
/// loopback port.
pub struct RouteApiClient {
    http: reqwest::Client,
    base: String,
}

impl RouteApiClient {
    pub fn new(port: u16) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            http,
            base: format!("http://127.0.0.1:{port}"),
        }
    }

    /// List the remote route set. Any transport or status failure
    /// degrades to an empty list: the managed server may simply not
    /// be running yet, and callers must treat that as "no routes",
    /// not as fatal.
    pub async fn list_routes(&self) -> Vec<RouteDefinition> {
        let url = format!("{}/routes/", self.base);
        let resp = match self.http.get(&url).send().await {
            Ok(r) => r,
            Err(err) => {
                warn!(url, error = %err, "route list unreachable, assuming empty");
                return Vec::new();
            }
        };
        if !resp.status().is_success() {
            warn!(url, status = %resp.status(), "route list rejected, assuming empty");
            return Vec::new();
        }
        match resp.json::<Vec<RouteDefinition>>().await {
            Ok(routes) => routes,
            Err(err) => {
                warn!(url, error = %err, "route list undecodable, assuming empty");
                Vec::new()
            }
        }
    }

    /// Create a route remotely and return the server-issued id. On any
    /// failure the caller must NOT insert the route locally; the two
    /// stores stay consistent by never holding unconfirmed routes.
    pub async fn create_route(&self, route: &RouteDefinition) -> anyhow::Result<String> {
        let url = format!("{}/routes/", self.base);
        let resp = self
            .http
            .post(&url)
            .json(route)
            .send()
            .await
            .with_context(|| format!("route create unreachable at {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("route create rejected with status {status}");
        }
        let body: Value = resp.json().await.context("route create returned no JSON")?;
        extract_id(&body).ok_or_else(|| anyhow::anyhow!("route create returned no id: {body}"))
    }

    /// Delete by server-issued id. On failure the caller must keep the
    /// local entry, mirroring the create rule.
    pub async fn delete_route(&self, id: &str) -> anyhow::Result<()> {
        let url = format!("{}/routes/{id}/", self.base);
        let resp = self
            .http
            .delete(&url)
            .send()
            .await
            .with_context(|| format!("route delete unreachable at {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("route delete rejected with status {status}");
        }
        Ok(())
    }

    pub async fn clear_routes(&self) -> anyhow::Result<()> {
        let url = format!("{}/routes/clear", self.base);
        let resp = self
            .http
            .post(&url)
            .send()
            .await
            .with_context(|| format!("route clear unreachable at {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("route clear rejected with status {status}");
        }
        Ok(())
    }

    /// Bulk import: clear the remote set, then upload the file as a
    /// multipart payload. The two-step protocol has a known window
    /// where a failed upload leaves the remote set empty; that is an
    /// accepted limitation, not something to retry silently.
    pub async fn load_bulk(&self, file: &Path) -> anyhow::Result<()> {
        self.clear_routes().await?;

        let bytes = std::fs::read(file)
            .with_context(|| format!("failed reading {}", file.display()))?;
        let file_name = file
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("routes.json")
            .to_string();
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/json")?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let url = format!("{}/routes/load", self.base);
        let resp = self
            .http
            .post(&url)
            .multipart(form)
            .send()
            .await
            .with_context(|| format!("route load unreachable at {url}"))?;
        let status = resp.status();
        if !status.is_success() {
            anyhow::bail!("route load rejected with status {status}");
        }
        Ok(())
    }
}

/// The create endpoint answers with either a full record or a bare id.
fn extract_id(body: &Value) -> Option<String> {
    match body {
        Value::String(id) => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(map) => match map.get("id") {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        },
        _ => None,
    }
}
