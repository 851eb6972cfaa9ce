//! MCP streamable-HTTP endpoint.
//!
//! One JSON-RPC request per POST. The protocol session id arrives in the
//! `Mcp-Session-Id` header; the session manager binds it to a sandbox on
//! the first tool call and every later call reuses the binding. Three
//! tools are exposed: `run_code`, `run_code_once` and `run_command`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use chrono::Utc;
use kruise_cluster::object::ANNOTATION_ACCESS_TOKEN;
use kruise_cluster::Sandbox;
use kruise_manager::{ClaimOptions, ManagerError};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::server::{authenticate, AppState};

pub const SESSION_HEADER: &str = "Mcp-Session-Id";
pub const TEMPLATE_HEADER: &str = "X-Template";
pub const TTL_HEADER: &str = "X-Sandbox-TTL";
pub const EXECUTION_TIMEOUT_HEADER: &str = "X-Execution-Timeout";

const PROTOCOL_VERSION: &str = "2025-03-26";
const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(300);

const CODE_PARSE_ERROR: i64 = -32700;
const CODE_INVALID_REQUEST: i64 = -32600;
const CODE_METHOD_NOT_FOUND: i64 = -32601;
const CODE_INVALID_PARAMS: i64 = -32602;
const CODE_INTERNAL: i64 = -32603;
const CODE_AUTH_FAILED: i64 = -32001;
const CODE_UNSUPPORTED_LANGUAGE: i64 = -32003;

const SUPPORTED_LANGUAGES: [&str; 6] = ["python", "javascript", "typescript", "r", "java", "bash"];

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/mcp", post(handle_post).delete(handle_delete).get(handle_get))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[allow(dead_code)]
    jsonrpc: Option<String>,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug)]
struct RpcError {
    code: i64,
    message: String,
}

impl RpcError {
    fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<ManagerError> for RpcError {
    fn from(err: ManagerError) -> Self {
        let code = match &err {
            ManagerError::AuthFailed(_) => CODE_AUTH_FAILED,
            ManagerError::BadRequest(_) => CODE_INVALID_PARAMS,
            _ => CODE_INTERNAL,
        };
        RpcError::new(code, err.to_string())
    }
}

async fn handle_get() -> StatusCode {
    // No server-initiated streams; tool results are returned on the POST.
    StatusCode::METHOD_NOT_ALLOWED
}

async fn handle_delete(State(state): State<Arc<AppState>>, headers: HeaderMap) -> StatusCode {
    if let Some(session_id) = header_str(&headers, SESSION_HEADER) {
        state.manager.sessions().remove(&session_id).await;
        info!(session_id, "mcp session closed by client");
    }
    StatusCode::NO_CONTENT
}

async fn handle_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let request: RpcRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => {
            return rpc_error_response(None, RpcError::new(CODE_PARSE_ERROR, err.to_string()))
        }
    };
    let id = request.id.clone();

    match request.method.as_str() {
        "initialize" => {
            let session_id = Uuid::new_v4().to_string();
            let result = json!({
                "protocolVersion": PROTOCOL_VERSION,
                "serverInfo": {"name": "kruise-gateway", "version": env!("CARGO_PKG_VERSION")},
                "capabilities": {"tools": {}}
            });
            let mut response = rpc_result_response(id, result);
            if let Ok(value) = session_id.parse() {
                response.headers_mut().insert(SESSION_HEADER, value);
            }
            response
        }
        "notifications/initialized" | "notifications/cancelled" => {
            StatusCode::ACCEPTED.into_response()
        }
        "tools/list" => rpc_result_response(id, json!({ "tools": tool_definitions() })),
        "tools/call" => match dispatch_tool(&state, &headers, request.params).await {
            Ok(result) => rpc_result_response(id, result),
            Err(err) => rpc_error_response(id, err),
        },
        "ping" => rpc_result_response(id, json!({})),
        other => rpc_error_response(
            id,
            RpcError::new(CODE_METHOD_NOT_FOUND, format!("unknown method {other}")),
        ),
    }
}

fn tool_definitions() -> Value {
    json!([
        {
            "name": "run_code",
            "description": "Run code in the session's sandbox; the sandbox is reused across calls.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "code": {"type": "string"},
                    "language": {"type": "string", "default": "python"}
                },
                "required": ["code"]
            }
        },
        {
            "name": "run_code_once",
            "description": "Run code in a throwaway sandbox that is deleted afterwards.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "code": {"type": "string"},
                    "language": {"type": "string", "default": "python"}
                },
                "required": ["code"]
            }
        },
        {
            "name": "run_command",
            "description": "Run a shell command in the session's sandbox.",
            "inputSchema": {
                "type": "object",
                "properties": {
                    "cmd": {"type": "string"},
                    "envs": {"type": "object"},
                    "cwd": {"type": "string"}
                },
                "required": ["cmd"]
            }
        }
    ])
}

#[derive(Debug, Deserialize)]
struct ToolCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

#[derive(Debug, Deserialize)]
struct RunCodeArgs {
    code: String,
    #[serde(default = "default_language")]
    language: String,
}

#[derive(Debug, Deserialize)]
struct RunCommandArgs {
    cmd: String,
    #[serde(default)]
    envs: HashMap<String, String>,
    #[serde(default)]
    cwd: Option<String>,
}

fn default_language() -> String {
    "python".to_string()
}

/// Per-call overrides taken from headers, falling back to server defaults.
struct CallContext {
    user: String,
    session_id: Option<String>,
    template: String,
    ttl: Duration,
    execution_timeout: Duration,
}

fn call_context(state: &AppState, headers: &HeaderMap) -> Result<CallContext, RpcError> {
    let user = authenticate(state, headers)
        .map_err(|err| RpcError::new(CODE_AUTH_FAILED, err.status().to_string()))?;
    let template = header_str(headers, TEMPLATE_HEADER)
        .unwrap_or_else(|| state.config.mcp_default_template.clone());
    let ttl = header_str(headers, TTL_HEADER)
        .and_then(|raw| raw.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(state.config.mcp_sandbox_ttl);
    let execution_timeout = header_str(headers, EXECUTION_TIMEOUT_HEADER)
        .and_then(|raw| raw.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_EXECUTION_TIMEOUT);
    Ok(CallContext {
        user,
        session_id: header_str(headers, SESSION_HEADER),
        template,
        ttl,
        execution_timeout,
    })
}

async fn dispatch_tool(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    params: Value,
) -> Result<Value, RpcError> {
    let call: ToolCall = serde_json::from_value(params)
        .map_err(|err| RpcError::new(CODE_INVALID_PARAMS, err.to_string()))?;
    let context = call_context(state, headers)?;

    match call.name.as_str() {
        "run_code" => {
            let args: RunCodeArgs = serde_json::from_value(call.arguments)
                .map_err(|err| RpcError::new(CODE_INVALID_PARAMS, err.to_string()))?;
            run_code(state, &context, args).await
        }
        "run_code_once" => {
            let args: RunCodeArgs = serde_json::from_value(call.arguments)
                .map_err(|err| RpcError::new(CODE_INVALID_PARAMS, err.to_string()))?;
            run_code_once(state, &context, args).await
        }
        "run_command" => {
            let args: RunCommandArgs = serde_json::from_value(call.arguments)
                .map_err(|err| RpcError::new(CODE_INVALID_PARAMS, err.to_string()))?;
            run_command(state, &context, args).await
        }
        other => Err(RpcError::new(
            CODE_METHOD_NOT_FOUND,
            format!("unknown tool {other}"),
        )),
    }
}

fn check_language(language: &str) -> Result<(), RpcError> {
    if SUPPORTED_LANGUAGES.contains(&language) {
        Ok(())
    } else {
        Err(RpcError::new(
            CODE_UNSUPPORTED_LANGUAGE,
            format!("unsupported language {language}"),
        ))
    }
}

async fn run_code(
    state: &Arc<AppState>,
    context: &CallContext,
    args: RunCodeArgs,
) -> Result<Value, RpcError> {
    check_language(&args.language)?;
    let session_id = context
        .session_id
        .clone()
        .ok_or_else(|| RpcError::new(CODE_INVALID_REQUEST, "missing Mcp-Session-Id header"))?;

    let session = state
        .manager
        .sessions()
        .get_or_create(&session_id, &context.user, &context.template, context.ttl)
        .await?;

    let sandbox = state
        .manager
        .cache()
        .sandbox(&session.sandbox_id)
        .ok_or_else(|| RpcError::new(CODE_INTERNAL, "session sandbox is gone"))?;

    let execution = state
        .manager
        .agent()
        .execute(
            &sandbox.status.ip,
            &session.access_token,
            &args.code,
            &args.language,
            context.execution_timeout,
        )
        .await?;

    // Keep the idle clock moving; failure here must not fail the call.
    if let Err(error) = state
        .manager
        .sessions()
        .refresh_ttl(&session_id, context.ttl)
        .await
    {
        warn!(session_id, %error, "failed to refresh session ttl");
    }

    Ok(tool_text_result(json!({
        "logs": execution.logs,
        "results": execution.results,
        "error": execution.error,
        "execution_count": execution.execution_count,
        "sandbox_id": session.sandbox_id,
    })))
}

async fn run_code_once(
    state: &Arc<AppState>,
    context: &CallContext,
    args: RunCodeArgs,
) -> Result<Value, RpcError> {
    check_language(&args.language)?;

    let access_token = Uuid::new_v4().to_string();
    let mut options = ClaimOptions::new(&context.user, &context.template);
    let token = access_token.clone();
    let ttl = context.ttl;
    options.modifier = Box::new(move |sandbox: &mut Sandbox| {
        sandbox
            .meta
            .annotations
            .insert(ANNOTATION_ACCESS_TOKEN.to_string(), token.clone());
        sandbox.spec.shutdown_time = Some(
            Utc::now()
                + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::max_value()),
        );
    });

    let sandbox = state.manager.claim_sandbox(options).await?;
    let sandbox_id = sandbox.id();

    let outcome = state
        .manager
        .agent()
        .execute(
            &sandbox.status.ip,
            &access_token,
            &args.code,
            &args.language,
            context.execution_timeout,
        )
        .await;

    // Deferred cleanup runs regardless of the execution outcome.
    if let Err(error) = state.manager.handle(&sandbox_id).kill().await {
        warn!(sandbox_id = %sandbox_id, %error, "failed to delete throwaway sandbox");
    }
    state.manager.retract_route(&sandbox_id).await;

    let execution = outcome?;
    Ok(tool_text_result(json!({
        "logs": execution.logs,
        "results": execution.results,
        "error": execution.error,
        "execution_count": execution.execution_count,
        "sandbox_id": sandbox_id,
    })))
}

async fn run_command(
    state: &Arc<AppState>,
    context: &CallContext,
    args: RunCommandArgs,
) -> Result<Value, RpcError> {
    let session_id = context
        .session_id
        .clone()
        .ok_or_else(|| RpcError::new(CODE_INVALID_REQUEST, "missing Mcp-Session-Id header"))?;

    let session = state
        .manager
        .sessions()
        .get_or_create(&session_id, &context.user, &context.template, context.ttl)
        .await?;
    let sandbox = state
        .manager
        .cache()
        .sandbox(&session.sandbox_id)
        .ok_or_else(|| RpcError::new(CODE_INTERNAL, "session sandbox is gone"))?;

    let result = state
        .manager
        .agent()
        .run_command(
            &sandbox.status.ip,
            &session.access_token,
            &args.cmd,
            args.envs,
            args.cwd.as_deref(),
            context.execution_timeout,
        )
        .await;

    let payload = match result {
        Ok(outcome) => json!({
            "stdout": outcome.stdout,
            "stderr": outcome.stderr,
            "exitCode": outcome.exit_code,
            "sandbox_id": session.sandbox_id,
        }),
        Err(err) => json!({
            "stdout": "",
            "stderr": "",
            "exitCode": -1,
            "sandbox_id": session.sandbox_id,
            "error": err.to_string(),
        }),
    };
    Ok(tool_text_result(payload))
}

fn tool_text_result(payload: Value) -> Value {
    let is_error = payload.get("error").map(|e| !e.is_null()).unwrap_or(false);
    json!({
        "content": [{"type": "text", "text": payload.to_string()}],
        "isError": is_error,
    })
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn rpc_result_response(id: Option<Value>, result: Value) -> Response {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id.unwrap_or(Value::Null),
        "result": result,
    }))
    .into_response()
}

fn rpc_error_response(id: Option<Value>, error: RpcError) -> Response {
    Json(json!({
        "jsonrpc": "2.0",
        "id": id.unwrap_or(Value::Null),
        "error": {"code": error.code, "message": error.message},
    }))
    .into_response()
}
