//! HTTP client for the per-sandbox agent runtime.
//!
//! Every sandbox pod runs an agent exposing a control endpoint (`/init`,
//! process RPCs) on port 49982 and a code-execution endpoint streaming SSE
//! on port 49999. The manager is a plain HTTP caller; nothing here assumes
//! anything about how the agent is implemented.

use std::collections::HashMap;
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::ManagerError;

pub const AGENT_CONTROL_PORT: u16 = 49982;
pub const AGENT_EXEC_PORT: u16 = 49999;

pub const HEADER_ACCESS_TOKEN: &str = "X-Access-Token";

#[derive(Clone)]
pub struct AgentClient {
    http: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct InitPayload<'a> {
    #[serde(rename = "envVars")]
    env_vars: &'a HashMap<String, String>,
    #[serde(rename = "accessToken")]
    access_token: &'a str,
}

#[derive(Debug, Serialize)]
struct ExecutePayload<'a> {
    code: &'a str,
    language: &'a str,
}

#[derive(Debug, Serialize)]
struct CommandPayload<'a> {
    cmd: &'a str,
    args: Vec<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cwd: Option<&'a str>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    envs: HashMap<String, String>,
    wait: bool,
}

/// Accumulated stdout/stderr lines from a code execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionLogs {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// Assembled result of one `/execute` stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub logs: ExecutionLogs,
    pub results: Vec<Value>,
    pub error: Option<Value>,
    pub execution_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, Deserialize)]
struct StreamLine {
    #[serde(rename = "type")]
    line_type: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

impl AgentClient {
    pub fn new(request_timeout: Duration) -> Result<Self, ManagerError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(request_timeout)
            .build()
            .map_err(|err| ManagerError::Internal(err.into()))?;
        Ok(Self { http })
    }

    /// Raw client, for callers that build their own sandbox requests.
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Pushes env vars and the access token into a freshly claimed sandbox.
    /// A non-2xx answer means the runtime is unusable.
    pub async fn init(
        &self,
        ip: &str,
        env_vars: &HashMap<String, String>,
        access_token: &str,
    ) -> Result<(), ManagerError> {
        let url = format!("http://{ip}:{AGENT_CONTROL_PORT}/init");
        let response = self
            .http
            .post(&url)
            .json(&InitPayload {
                env_vars,
                access_token,
            })
            .send()
            .await
            .map_err(|err| ManagerError::Upstream(format!("init {ip}: {err}")))?;

        if !response.status().is_success() {
            return Err(ManagerError::Upstream(format!(
                "init {ip}: runtime answered {}",
                response.status()
            )));
        }
        debug!(ip, "agent runtime initialized");
        Ok(())
    }

    /// Runs code in the sandbox and assembles the SSE stream into one
    /// [`Execution`]. Lines typed `stdout`/`stderr` are appended to the
    /// logs, `result` entries are collected, `error` stops the collection
    /// and `number_of_executions` carries the kernel counter.
    pub async fn execute(
        &self,
        ip: &str,
        access_token: &str,
        code: &str,
        language: &str,
        timeout: Duration,
    ) -> Result<Execution, ManagerError> {
        let url = format!("http://{ip}:{AGENT_EXEC_PORT}/execute");
        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .header(HEADER_ACCESS_TOKEN, access_token)
            .json(&ExecutePayload { code, language })
            .send()
            .await
            .map_err(|err| upstream_or_timeout(ip, err))?;

        if !response.status().is_success() {
            return Err(ManagerError::Upstream(format!(
                "execute {ip}: runtime answered {}",
                response.status()
            )));
        }

        let mut execution = Execution::default();
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| upstream_or_timeout(ip, err))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                apply_stream_line(&mut execution, &line);
            }
        }
        if !buffer.trim().is_empty() {
            let rest = buffer.trim().to_string();
            apply_stream_line(&mut execution, &rest);
        }
        Ok(execution)
    }

    /// Runs a shell command through the agent's process API and waits for
    /// completion.
    pub async fn run_command(
        &self,
        ip: &str,
        access_token: &str,
        cmd: &str,
        envs: HashMap<String, String>,
        cwd: Option<&str>,
        timeout: Duration,
    ) -> Result<CommandOutcome, ManagerError> {
        let url = format!("http://{ip}:{AGENT_CONTROL_PORT}/process/start");
        let response = self
            .http
            .post(&url)
            .timeout(timeout)
            .header(HEADER_ACCESS_TOKEN, access_token)
            .json(&CommandPayload {
                cmd: "/bin/bash",
                args: vec!["-l", "-c", cmd],
                cwd,
                envs,
                wait: true,
            })
            .send()
            .await
            .map_err(|err| upstream_or_timeout(ip, err))?;

        if !response.status().is_success() {
            return Err(ManagerError::Upstream(format!(
                "process start {ip}: runtime answered {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|err| ManagerError::Upstream(format!("process start {ip}: {err}")))
    }
}

fn upstream_or_timeout(ip: &str, err: reqwest::Error) -> ManagerError {
    if err.is_timeout() {
        ManagerError::Timeout(format!("agent {ip}"))
    } else {
        ManagerError::Upstream(format!("agent {ip}: {err}"))
    }
}

/// Parses one SSE line. `data:`-prefixed framing is stripped; empty and
/// comment lines are skipped. Unknown types are logged and ignored so agent
/// upgrades do not break older managers.
fn apply_stream_line(execution: &mut Execution, raw: &str) {
    let line = raw.strip_prefix("data:").map(str::trim).unwrap_or(raw);
    if line.is_empty() || line.starts_with(':') {
        return;
    }
    let parsed: StreamLine = match serde_json::from_str(line) {
        Ok(parsed) => parsed,
        Err(error) => {
            warn!(%error, "unparseable execute stream line");
            return;
        }
    };
    match parsed.line_type.as_str() {
        "stdout" => execution
            .logs
            .stdout
            .push(parsed.text.unwrap_or_default()),
        "stderr" => execution
            .logs
            .stderr
            .push(parsed.text.unwrap_or_default()),
        "result" => {
            if let Some(data) = parsed.data {
                execution.results.push(data);
            }
        }
        "error" => execution.error = parsed.data.or(parsed.text.map(Value::String)),
        "number_of_executions" => {
            execution.execution_count = parsed
                .data
                .as_ref()
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;
        }
        other => debug!(line_type = other, "ignoring unknown stream line type"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_lines_assemble_execution() {
        let mut execution = Execution::default();
        apply_stream_line(&mut execution, r#"data: {"type":"stdout","text":"hello"}"#);
        apply_stream_line(&mut execution, r#"{"type":"stderr","text":"warning"}"#);
        apply_stream_line(&mut execution, r#"{"type":"result","data":{"text/plain":"42"}}"#);
        apply_stream_line(&mut execution, r#"{"type":"number_of_executions","data":7}"#);

        assert_eq!(execution.logs.stdout, vec!["hello"]);
        assert_eq!(execution.logs.stderr, vec!["warning"]);
        assert_eq!(execution.results.len(), 1);
        assert_eq!(execution.execution_count, 7);
        assert!(execution.error.is_none());
    }

    #[test]
    fn error_lines_are_captured() {
        let mut execution = Execution::default();
        apply_stream_line(
            &mut execution,
            r#"{"type":"error","data":{"name":"NameError","value":"x"}}"#,
        );
        assert!(execution.error.is_some());
    }

    #[test]
    fn garbage_and_comments_are_ignored() {
        let mut execution = Execution::default();
        apply_stream_line(&mut execution, "");
        apply_stream_line(&mut execution, ": keep-alive");
        apply_stream_line(&mut execution, "not json at all");
        apply_stream_line(&mut execution, r#"{"type":"telemetry","data":1}"#);
        assert_eq!(execution, Execution::default());
    }
}
