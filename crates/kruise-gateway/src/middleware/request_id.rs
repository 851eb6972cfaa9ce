//! Request-ID correlation.
//!
//! Every request gets an id (incoming `X-Request-Id` wins), exposed to
//! handlers through request extensions, echoed as a response header and
//! injected into JSON error bodies so `{code, message, request_id}` always
//! correlates with the logs.

use axum::{
    body::Body,
    extract::Request,
    http::{header::HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use serde_json::Value;
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

const MAX_BUFFERED_ERROR_BODY: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct RequestId(pub String);

pub async fn propagate(mut request: Request, next: Next) -> Response {
    let id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(RequestId(id.clone()));
    let span = tracing::info_span!("request", request_id = %id);
    let _enter = span.enter();

    let mut response = next.run(request).await;
    if response.status().is_client_error() || response.status().is_server_error() {
        response = annotate_error_body(response, &id).await;
    }

    if let Ok(value) = HeaderValue::from_str(&id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

/// Buffers small JSON error bodies and stamps the request id into them.
/// Anything unparseable or oversized passes through untouched.
async fn annotate_error_body(response: Response, request_id: &str) -> Response {
    let is_json = response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.starts_with("application/json"))
        .unwrap_or(false);
    if !is_json {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_BUFFERED_ERROR_BODY).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return Response::from_parts(parts, Body::empty());
        }
    };

    let annotated = match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(mut map)) => {
            map.entry("request_id")
                .or_insert_with(|| Value::String(request_id.to_string()));
            serde_json::to_vec(&Value::Object(map)).unwrap_or_else(|_| bytes.to_vec())
        }
        _ => bytes.to_vec(),
    };

    parts.headers.remove(axum::http::header::CONTENT_LENGTH);
    let mut response = Response::from_parts(parts, Body::from(annotated));
    response.headers_mut().insert(
        axum::http::header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
