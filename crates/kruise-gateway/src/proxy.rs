//! Sandbox proxy entry.
//!
//! Every request that does not match a registered API route lands here.
//! The router decides whether it targets a sandbox (by authority or by
//! `/kruise/` path), and if so whether this replica owns the route or a
//! peer does. Responses are streamed; the gateway never buffers sandbox
//! output.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use kruise_manager::{ManagerError, RouteDecision, UpstreamHost};
use serde_json::Value;
use tracing::{debug, warn};

use crate::server::{ApiError, AppState};

const MAX_PROXY_BODY: usize = 32 * 1024 * 1024;

/// Headers that must not be forwarded verbatim.
const HOP_BY_HOP: [&str; 5] = [
    "host",
    "connection",
    "transfer-encoding",
    "content-length",
    "keep-alive",
];

pub async fn proxy_request(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Response, ApiError> {
    let authority = request
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .or_else(|| request.uri().authority().map(|a| a.to_string()))
        .unwrap_or_default();
    let path = request.uri().path().to_string();
    let query = request.uri().query().map(str::to_string);
    let access_token = request
        .headers()
        .get(kruise_manager::router::HEADER_ACCESS_TOKEN)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let decision = state
        .manager
        .router()
        .decide(&authority, &path, access_token.as_deref())?;

    let Some(decision) = decision else {
        // Passthrough authority but no registered API route matched.
        return Err(ApiError::new(StatusCode::NOT_FOUND, "unknown route"));
    };

    forward(state, decision, request, query).await
}

async fn forward(
    state: Arc<AppState>,
    decision: RouteDecision,
    request: Request,
    query: Option<String>,
) -> Result<Response, ApiError> {
    let method = request.method().clone();

    let mut url = match &decision.upstream {
        UpstreamHost::Local { sandbox_ip } => {
            format!("http://{}:{}{}", sandbox_ip, decision.port, decision.path)
        }
        // The peer re-runs the routing decision, so the original path shape
        // is preserved.
        UpstreamHost::Peer { host } => format!("http://{}{}", host, request.uri().path()),
    };
    if let Some(query) = &query {
        url.push('?');
        url.push_str(query);
    }
    debug!(sandbox_id = %decision.sandbox_id, user = %decision.user, %url, "proxying request");

    let headers = request.headers().clone();
    let body = axum::body::to_bytes(request.into_body(), MAX_PROXY_BODY)
        .await
        .map_err(|_| ApiError::new(StatusCode::PAYLOAD_TOO_LARGE, "request body too large"))?;

    let client = state.manager.agent().http();
    let mut upstream = client.request(method, &url);
    for (name, value) in &headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        upstream = upstream.header(name, value);
    }
    for (name, value) in &decision.extra_headers {
        upstream = upstream.header(name, value);
    }
    if !body.is_empty() {
        upstream = upstream.body(body);
    }

    let response = upstream.send().await.map_err(|err| {
        warn!(sandbox_id = %decision.sandbox_id, error = %err, "upstream unreachable");
        ApiError::from(ManagerError::Upstream(format!(
            "sandbox {}: {err}",
            decision.sandbox_id
        )))
    })?;

    let status = response.status();
    let mut response_headers = HeaderMap::new();
    for (name, value) in response.headers() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        response_headers.insert(name.clone(), value.clone());
    }

    let stream = Body::from_stream(response.bytes_stream());
    let mut out = Response::new(stream);
    *out.status_mut() = status;
    *out.headers_mut() = response_headers;
    Ok(out)
}

/// CDP bootstrap: fetches `/json/version` from the sandbox's devtools port
/// and rewrites the websocket debugger address to the public authority.
pub async fn browser_handshake(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let handle = state.manager.handle(&id);
    let response = handle
        .request(
            reqwest::Method::GET,
            "/json/version",
            9222,
            &Default::default(),
            Vec::new(),
        )
        .await?;

    if !response.status().is_success() {
        return Err(ApiError::new(
            StatusCode::BAD_GATEWAY,
            format!("devtools answered {}", response.status()),
        ));
    }

    let mut handshake: Value = response
        .json()
        .await
        .map_err(|err| ApiError::new(StatusCode::BAD_GATEWAY, format!("invalid handshake: {err}")))?;

    if let Some(object) = handshake.as_object_mut() {
        let public = format!("ws://9222-{}.{}/devtools/browser", id, state.config.domain);
        if let Some(existing) = object.get("webSocketDebuggerUrl").and_then(Value::as_str) {
            let rewritten = existing
                .rsplit('/')
                .next()
                .map(|browser_id| format!("{public}/{browser_id}"))
                .unwrap_or(public);
            object.insert("webSocketDebuggerUrl".to_string(), Value::String(rewritten));
        }
    }

    Ok(Json(handshake).into_response())
}
