use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::Deserialize;
use serde_json::{json, Value};

/// Blocking line-delimited client for the daemon's control socket,
/// used by every subcommand except `serve` and `preview`. One request
/// per connection; the write half is shut down so the daemon sees EOF
/// after the single request line.
pub struct RpcClient {
    socket_path: PathBuf,
}

#[derive(Debug, Deserialize)]
struct Response {
    ok: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl RpcClient {
    pub fn new(socket_path: &Path) -> Self {
        Self {
            socket_path: socket_path.to_path_buf(),
        }
    }

    /// Issue one intent and unwrap the envelope: `Ok` carries the
    /// `result` payload, a daemon-side failure becomes an error
    /// carrying the daemon's message and stable code.
    pub fn call(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        let line = self.exchange(method, params)?;
        if line.is_empty() {
            bail!("daemon closed the connection without a response");
        }

        let resp: Response =
            serde_json::from_str(&line).context("undecodable response from the daemon")?;

        if resp.ok {
            return Ok(resp.result.unwrap_or(Value::Null));
        }
        match resp.error {
            Some(err) => bail!("{} ({})", err.message, err.code),
            None => bail!("daemon rejected the request without detail"),
        }
    }

    fn exchange(&self, method: &str, params: Value) -> anyhow::Result<String> {
        let mut stream = UnixStream::connect(&self.socket_path).with_context(|| {
            format!(
                "failed to connect to {}. Is `mockpit serve` running?",
                self.socket_path.display()
            )
        })?;

        let envelope = json!({
            "request_id": uuid::Uuid::now_v7().to_string(),
            "method": method,
            "params": params,
        });
        let mut payload = serde_json::to_string(&envelope)?;
        payload.push('\n');
        stream.write_all(payload.as_bytes())?;
        stream.shutdown(std::net::Shutdown::Write)?;

        let mut line = String::new();
        BufReader::new(stream).read_line(&mut line)?;
        Ok(line.trim().to_owned())
    }
}
