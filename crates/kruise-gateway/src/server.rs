use std::{collections::BTreeMap, env, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use kruise_cluster::object::{ANNOTATION_ACCESS_TOKEN, ANNOTATION_METADATA};
use kruise_cluster::{ClusterBackend, MemoryBackend, Sandbox, SandboxState};
use kruise_manager::{
    ClaimOptions, CsiMountOptions, InitRuntimeOptions, InplaceUpdateOptions, ManagerConfig,
    ManagerError, RouteRecord, SandboxManager, SyncEnvelope, TimeoutOptions, UserSession,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use utoipa::{IntoParams, OpenApi};
use uuid::Uuid;

use crate::mcp;
use crate::middleware::rate_limit::{self, RateLimitConfig, RateLimiter};
use crate::middleware::request_id;
use crate::models::{
    encode_metadata, parse_extensions, validate_timeout, ApiKeyDto, CreateKeyBody,
    CreateSandboxBody, ResumeBody, SandboxDto, TimeoutBody, DEFAULT_TIMEOUT_SECONDS,
};
use crate::proxy;

pub const ANONYMOUS_USER: &str = kruise_manager::router::ANONYMOUS_USER;
pub const API_KEY_HEADER: &str = "X-API-KEY";

pub async fn run() -> Result<()> {
    let config = AppConfig::from_env()?;

    // Standalone mode runs against the in-memory backend with its built-in
    // reconciler; a cluster-backed deployment swaps the backend behind the
    // same trait.
    let backend: Arc<dyn ClusterBackend> = Arc::new(MemoryBackend::reconciling());
    let manager = SandboxManager::new(backend, config.manager_config())?;
    manager.start(config.admin_key.clone()).await?;

    let state = Arc::new(AppState {
        manager: Arc::clone(&manager),
        config: config.clone(),
    });

    let app = build_router(state.clone())
        .layer(middleware::from_fn_with_state(
            RateLimiter::shared(RateLimitConfig::default()),
            rate_limit::enforce,
        ))
        .layer(TraceLayer::new_for_http());

    let session_app = build_session_router(state.clone());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listen socket")?;
    let session_listener = tokio::net::TcpListener::bind(config.session_sync_addr)
        .await
        .context("failed to bind session sync socket")?;

    info!(addr = %config.listen_addr, "kruise-gateway listening");
    info!(addr = %config.session_sync_addr, "session sync listening");

    let mut servers = Vec::new();
    servers.push(tokio::spawn(serve(listener, app)));
    servers.push(tokio::spawn(serve(session_listener, session_app)));

    if config.mcp_enabled {
        let mcp_listener = tokio::net::TcpListener::bind(config.mcp_addr)
            .await
            .context("failed to bind mcp socket")?;
        info!(addr = %config.mcp_addr, "mcp server listening");
        let mcp_app = mcp::build_router(state.clone())
            .layer(middleware::from_fn(request_id::propagate))
            .layer(TraceLayer::new_for_http());
        servers.push(tokio::spawn(serve(mcp_listener, mcp_app)));
    }

    for server in servers {
        server.await.context("server task panicked")??;
    }
    manager.shutdown();
    Ok(())
}

async fn serve(listener: tokio::net::TcpListener, app: Router) -> Result<()> {
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server exited")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining");
}

fn recover_panic(panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "panic".to_string());
    error!(panic = %detail, "handler panicked");
    ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = api_router();
    Router::new()
        .merge(api.clone())
        .nest("/kruise/api", api)
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/peer/hello", get(peer_hello))
        .route("/route/sync", post(route_sync))
        .route("/browser/:id/json/version", get(proxy::browser_handshake))
        .fallback(proxy::proxy_request)
        .layer(CatchPanicLayer::custom(recover_panic))
        .layer(middleware::from_fn(request_id::propagate))
        .with_state(state)
}

fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/sandboxes", post(create_sandbox))
        .route("/v2/sandboxes", get(list_sandboxes))
        .route("/sandboxes/:id", get(get_sandbox).delete(delete_sandbox))
        .route("/sandboxes/:id/pause", post(pause_sandbox))
        .route("/sandboxes/:id/resume", post(resume_sandbox))
        .route("/sandboxes/:id/connect", post(connect_sandbox))
        .route("/sandboxes/:id/timeout", post(set_sandbox_timeout))
        .route("/api-keys", get(list_api_keys).post(create_api_key))
        .route("/api-keys/:id", axum::routing::delete(delete_api_key))
}

fn build_session_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/session/hello", get(session_hello))
        .route("/session/sync", post(session_sync))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(OpenApi)]
#[openapi(
    paths(create_sandbox, list_sandboxes, get_sandbox, delete_sandbox, pause_sandbox, resume_sandbox, connect_sandbox, set_sandbox_timeout),
    components(schemas(CreateSandboxBody, ResumeBody, TimeoutBody, SandboxDto))
)]
pub struct ApiDoc;

pub struct AppState {
    pub manager: Arc<SandboxManager>,
    pub config: AppConfig,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub listen_addr: SocketAddr,
    pub session_sync_addr: SocketAddr,
    pub mcp_addr: SocketAddr,
    pub mcp_enabled: bool,
    pub domain: String,
    pub enable_auth: bool,
    pub admin_key: Option<String>,
    pub max_timeout: Duration,
    pub mcp_sandbox_ttl: Duration,
    pub mcp_default_template: String,
    pub system_namespace: String,
    pub peer_selector: String,
    pub self_ip: String,
    pub max_claim_workers: usize,
    pub max_create_qps: u32,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let port: u16 = env_or("PORT", "8080").parse().context("invalid PORT")?;
        let session_sync_port: u16 = env_or("MCP_SESSION_SYNC_PORT", "8081")
            .parse()
            .context("invalid MCP_SESSION_SYNC_PORT")?;
        let mcp_port: u16 = env_or("MCP_SERVER_PORT", "8082")
            .parse()
            .context("invalid MCP_SERVER_PORT")?;

        let max_timeout_seconds: u64 = env_or("E2B_MAX_TIMEOUT", "2592000")
            .parse()
            .context("invalid E2B_MAX_TIMEOUT")?;
        let mcp_sandbox_ttl: u64 = env_or("MCP_SANDBOX_TTL", "1800")
            .parse()
            .context("invalid MCP_SANDBOX_TTL")?;

        Ok(Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], port)),
            session_sync_addr: SocketAddr::from(([0, 0, 0, 0], session_sync_port)),
            mcp_addr: SocketAddr::from(([0, 0, 0, 0], mcp_port)),
            mcp_enabled: env_or("MCP_SERVER_ENABLED", "true") == "true",
            domain: env_or("E2B_DOMAIN", "localhost"),
            enable_auth: env_or("E2B_ENABLE_AUTH", "true") == "true",
            admin_key: env::var("E2B_ADMIN_KEY").ok().filter(|k| !k.is_empty()),
            max_timeout: Duration::from_secs(max_timeout_seconds),
            mcp_sandbox_ttl: Duration::from_secs(mcp_sandbox_ttl),
            mcp_default_template: env_or("MCP_DEFAULT_TEMPLATE", "code-interpreter"),
            system_namespace: env_or("SYSTEM_NAMESPACE", "kruise-system"),
            peer_selector: env_or("PEER_SELECTOR", "app=kruise-gateway"),
            self_ip: env_or("POD_IP", "127.0.0.1"),
            max_claim_workers: env_or("MAX_CLAIM_WORKERS", "16")
                .parse()
                .context("invalid MAX_CLAIM_WORKERS")?,
            max_create_qps: env_or("MAX_CREATE_QPS", "50")
                .parse()
                .context("invalid MAX_CREATE_QPS")?,
        })
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            system_namespace: self.system_namespace.clone(),
            self_ip: self.self_ip.clone(),
            peer_selector: self.peer_selector.clone(),
            gateway_port: self.listen_addr.port(),
            session_sync_port: self.session_sync_addr.port(),
            max_timeout: self.max_timeout,
            max_claim_workers: self.max_claim_workers,
            max_create_qps: self.max_create_qps,
            ..ManagerConfig::default()
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics() -> impl IntoResponse {
    (StatusCode::OK, "# metrics placeholder\nkruise_gateway_up 1\n")
}

/// Resolves the calling user from `X-API-KEY`, or the anonymous user when
/// authentication is disabled.
pub fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    if !state.config.enable_auth {
        return Ok(ANONYMOUS_USER.to_string());
    }
    let key = headers
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "missing X-API-KEY header"))?;

    state
        .manager
        .keys()
        .load_by_key(key)
        .map(|record| record.created_by)
        .ok_or_else(|| ApiError::new(StatusCode::UNAUTHORIZED, "invalid API key"))
}

/// Cache read with read-your-writes: a pending expectation for the key
/// must be satisfied before the mirrored copy is trusted. A cache that
/// cannot catch up surfaces as a transient 504, never as a stale object.
async fn cached_sandbox(state: &AppState, id: &str) -> Result<Sandbox, ApiError> {
    let cache = state.manager.cache();
    if cache
        .expectations()
        .wait_satisfied(cache, kruise_cluster::Kind::Sandbox, id, Duration::from_secs(2))
        .await
        .is_err()
    {
        return Err(ApiError::new(
            StatusCode::GATEWAY_TIMEOUT,
            "cache has not caught up yet, retry",
        ));
    }
    cache
        .sandbox(id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "sandbox not found"))
}

/// Owner check shared by all single-sandbox endpoints. The admin user sees
/// every sandbox.
fn authorize_sandbox(user: &str, sandbox: &Sandbox) -> Result<(), ApiError> {
    if sandbox.owner() == user || user == kruise_manager::keys::ADMIN_USER {
        return Ok(());
    }
    // Cross-user reads look exactly like a missing sandbox.
    Err(ApiError::new(StatusCode::NOT_FOUND, "sandbox not found"))
}

#[utoipa::path(
    post,
    path = "/sandboxes",
    request_body = CreateSandboxBody,
    responses(
        (status = 201, description = "Sandbox claimed", body = SandboxDto),
        (status = 400, description = "Invalid metadata or timeout"),
        (status = 401, description = "Missing or invalid API key"),
        (status = 404, description = "Unknown template"),
        (status = 500, description = "No stock or claim failure")
    )
)]
async fn create_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(mut body): Json<CreateSandboxBody>,
) -> Result<(StatusCode, Json<SandboxDto>), ApiError> {
    let user = authenticate(&state, &headers)?;
    let timeout = validate_timeout(
        body.timeout.unwrap_or(DEFAULT_TIMEOUT_SECONDS),
        state.config.max_timeout,
    )?;
    let extensions = parse_extensions(&mut body.metadata)?;
    let metadata_json = encode_metadata(&body.metadata)?;

    if extensions.csi_volume_name.is_some() != extensions.csi_mount_point.is_some() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "csi-volume-name and csi-mount-point must be set together",
        ));
    }

    let mut options = ClaimOptions::new(&user, &body.template_id);
    options.reserve_failed_sandbox = extensions.reserve_failed_sandbox;

    let access_token = Uuid::new_v4().to_string();
    let auto_pause = body.auto_pause;
    let max_timeout = state.config.max_timeout;
    let token = access_token.clone();
    options.modifier = Box::new(move |sandbox: &mut Sandbox| {
        sandbox
            .meta
            .annotations
            .insert(ANNOTATION_ACCESS_TOKEN.to_string(), token.clone());
        sandbox
            .meta
            .annotations
            .insert(ANNOTATION_METADATA.to_string(), metadata_json.clone());
        let now = Utc::now();
        if auto_pause {
            sandbox.spec.pause_time = Some(now + chrono_dur(timeout));
            sandbox.spec.shutdown_time = Some(now + chrono_dur(max_timeout));
        } else {
            sandbox.spec.shutdown_time = Some(now + chrono_dur(timeout));
            sandbox.spec.pause_time = None;
        }
    });

    if !extensions.skip_init_runtime {
        options.init_runtime = Some(InitRuntimeOptions {
            env_vars: body.env_vars.clone(),
        });
    }
    if let Some(image) = extensions.image {
        options.inplace_update = Some(InplaceUpdateOptions {
            image,
            timeout: extensions
                .inplace_update_timeout
                .unwrap_or(Duration::from_secs(60)),
        });
    }
    if let (Some(volume_name), Some(mount_point)) =
        (extensions.csi_volume_name, extensions.csi_mount_point)
    {
        options.csi_mount = Some(CsiMountOptions {
            volume_name,
            mount_point,
        });
    }

    let sandbox = state.manager.claim_sandbox(options).await?;
    Ok((
        StatusCode::CREATED,
        Json(SandboxDto::from_sandbox(&sandbox, &state.config.domain)),
    ))
}

#[derive(Debug, Default, Deserialize, IntoParams)]
pub struct ListQuery {
    #[serde(default)]
    pub state: Option<String>,
    /// Comma-separated `key=value` metadata filters.
    #[serde(default)]
    pub metadata: Option<String>,
}

#[utoipa::path(
    get,
    path = "/v2/sandboxes",
    params(ListQuery),
    responses(
        (status = 200, description = "Sandboxes of the calling user", body = [SandboxDto]),
        (status = 400, description = "Invalid filter"),
        (status = 401, description = "Missing or invalid API key")
    )
)]
async fn list_sandboxes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<SandboxDto>>, ApiError> {
    let user = authenticate(&state, &headers)?;

    let state_filter = match query.state.as_deref() {
        None => None,
        Some("running") => Some(SandboxState::Running),
        Some("paused") => Some(SandboxState::Paused),
        Some("pending") => Some(SandboxState::Pending),
        Some(other) => {
            return Err(ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("unknown state filter {other}"),
            ))
        }
    };
    let metadata_filter = parse_metadata_filter(query.metadata.as_deref())?;

    let admin = user == kruise_manager::keys::ADMIN_USER;
    let sandboxes = state.manager.cache().list_sandboxes(|sandbox| {
        if sandbox.owner().is_empty() {
            return false;
        }
        if !admin && sandbox.owner() != user {
            return false;
        }
        if let Some(wanted) = state_filter {
            if sandbox.status.state != wanted {
                return false;
            }
        }
        if !metadata_filter.is_empty() {
            let metadata = crate::models::decode_metadata(sandbox);
            if !metadata_filter
                .iter()
                .all(|(k, v)| metadata.get(k) == Some(v))
            {
                return false;
            }
        }
        true
    });

    let mut dtos: Vec<SandboxDto> = sandboxes
        .iter()
        .map(|sandbox| SandboxDto::from_sandbox(sandbox, &state.config.domain))
        .collect();
    dtos.sort_by(|a, b| a.sandbox_id.cmp(&b.sandbox_id));
    Ok(Json(dtos))
}

fn parse_metadata_filter(raw: Option<&str>) -> Result<BTreeMap<String, String>, ApiError> {
    let mut filter = BTreeMap::new();
    let Some(raw) = raw else {
        return Ok(filter);
    };
    for pair in raw.split(',').filter(|s| !s.is_empty()) {
        let (key, value) = pair.split_once('=').ok_or_else(|| {
            ApiError::new(
                StatusCode::BAD_REQUEST,
                format!("metadata filter term {pair} must be key=value"),
            )
        })?;
        filter.insert(key.to_string(), value.to_string());
    }
    Ok(filter)
}

#[utoipa::path(
    get,
    path = "/sandboxes/{id}",
    params(("id" = String, Path, description = "Sandbox identifier")),
    responses(
        (status = 200, description = "Sandbox details", body = SandboxDto),
        (status = 404, description = "Sandbox not found")
    )
)]
async fn get_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<SandboxDto>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let sandbox = cached_sandbox(&state, &id).await?;
    authorize_sandbox(&user, &sandbox)?;
    Ok(Json(SandboxDto::from_sandbox(&sandbox, &state.config.domain)))
}

#[utoipa::path(
    delete,
    path = "/sandboxes/{id}",
    params(("id" = String, Path, description = "Sandbox identifier")),
    responses(
        (status = 204, description = "Sandbox deletion requested"),
        (status = 404, description = "Sandbox not found")
    )
)]
async fn delete_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let user = authenticate(&state, &headers)?;
    let sandbox = cached_sandbox(&state, &id).await?;
    authorize_sandbox(&user, &sandbox)?;

    state.manager.handle(&id).kill().await?;
    state.manager.retract_route(&id).await;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/sandboxes/{id}/pause",
    params(("id" = String, Path, description = "Sandbox identifier")),
    responses(
        (status = 204, description = "Sandbox paused"),
        (status = 404, description = "Sandbox not found"),
        (status = 409, description = "Sandbox not running")
    )
)]
async fn pause_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let user = authenticate(&state, &headers)?;
    let sandbox = cached_sandbox(&state, &id).await?;
    authorize_sandbox(&user, &sandbox)?;

    state.manager.handle(&id).pause().await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/sandboxes/{id}/resume",
    params(("id" = String, Path, description = "Sandbox identifier")),
    request_body = ResumeBody,
    responses(
        (status = 204, description = "Sandbox resumed"),
        (status = 404, description = "Sandbox not found"),
        (status = 409, description = "Sandbox not paused")
    )
)]
async fn resume_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<ResumeBody>>,
) -> Result<StatusCode, ApiError> {
    let user = authenticate(&state, &headers)?;
    let sandbox = cached_sandbox(&state, &id).await?;
    authorize_sandbox(&user, &sandbox)?;

    let seconds = body
        .and_then(|Json(b)| b.timeout_seconds)
        .unwrap_or(DEFAULT_TIMEOUT_SECONDS);
    let timeout = validate_timeout(seconds, state.config.max_timeout)?;
    state.manager.handle(&id).resume(timeout).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/sandboxes/{id}/connect",
    params(("id" = String, Path, description = "Sandbox identifier")),
    request_body = ResumeBody,
    responses(
        (status = 200, description = "Already running; timeout refreshed", body = SandboxDto),
        (status = 201, description = "Resumed from pause", body = SandboxDto),
        (status = 404, description = "Sandbox not found"),
        (status = 409, description = "Sandbox is terminating")
    )
)]
async fn connect_sandbox(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Option<Json<ResumeBody>>,
) -> Result<(StatusCode, Json<SandboxDto>), ApiError> {
    let user = authenticate(&state, &headers)?;
    let sandbox = cached_sandbox(&state, &id).await?;
    authorize_sandbox(&user, &sandbox)?;

    let seconds = body
        .and_then(|Json(b)| b.timeout_seconds)
        .unwrap_or(DEFAULT_TIMEOUT_SECONDS);
    let timeout = validate_timeout(seconds, state.config.max_timeout)?;

    let handle = state.manager.handle(&id);
    let status = match sandbox.status.state {
        SandboxState::Paused => {
            handle.resume(timeout).await?;
            StatusCode::CREATED
        }
        _ => {
            handle
                .save_timeout(TimeoutOptions {
                    timeout,
                    auto_pause: sandbox.spec.pause_time.is_some(),
                })
                .await?;
            StatusCode::OK
        }
    };

    let refreshed = handle.current().await?;
    Ok((
        status,
        Json(SandboxDto::from_sandbox(&refreshed, &state.config.domain)),
    ))
}

#[utoipa::path(
    post,
    path = "/sandboxes/{id}/timeout",
    params(("id" = String, Path, description = "Sandbox identifier")),
    request_body = TimeoutBody,
    responses(
        (status = 204, description = "Timeout updated"),
        (status = 400, description = "Timeout out of range"),
        (status = 404, description = "Sandbox not found"),
        (status = 409, description = "Sandbox is terminating")
    )
)]
async fn set_sandbox_timeout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<TimeoutBody>,
) -> Result<StatusCode, ApiError> {
    let user = authenticate(&state, &headers)?;
    let sandbox = cached_sandbox(&state, &id).await?;
    authorize_sandbox(&user, &sandbox)?;

    let timeout = validate_timeout(body.timeout_seconds, state.config.max_timeout)?;
    state
        .manager
        .handle(&id)
        .save_timeout(TimeoutOptions {
            timeout,
            auto_pause: sandbox.spec.pause_time.is_some(),
        })
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_api_keys(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<ApiKeyDto>>, ApiError> {
    let user = authenticate(&state, &headers)?;
    let records = state.manager.keys().list_by_owner(&user);
    Ok(Json(records.into_iter().map(ApiKeyDto::redacted).collect()))
}

async fn create_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateKeyBody>,
) -> Result<(StatusCode, Json<ApiKeyDto>), ApiError> {
    let user = authenticate(&state, &headers)?;
    if body.name.trim().is_empty() {
        return Err(ApiError::new(StatusCode::BAD_REQUEST, "key name cannot be empty"));
    }
    let record = state.manager.keys().create_key(&user, body.name.trim()).await?;
    Ok((StatusCode::CREATED, Json(ApiKeyDto::with_key(record))))
}

async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let user = authenticate(&state, &headers)?;
    let record = state
        .manager
        .keys()
        .load_by_id(id)
        .ok_or_else(|| ApiError::new(StatusCode::NOT_FOUND, "api key not found"))?;
    if record.created_by != user && user != kruise_manager::keys::ADMIN_USER {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "api key not found"));
    }
    state.manager.keys().delete_by_id(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct HelloQuery {
    #[serde(default)]
    pub from: String,
}

async fn peer_hello(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HelloQuery>,
) -> StatusCode {
    state.manager.membership().register_hello(&query.from);
    StatusCode::OK
}

async fn route_sync(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<SyncEnvelope<RouteRecord>>,
) -> StatusCode {
    state.manager.apply_route_sync(envelope);
    StatusCode::OK
}

async fn session_hello(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HelloQuery>,
) -> StatusCode {
    state.manager.membership().register_hello(&query.from);
    StatusCode::OK
}

async fn session_sync(
    State(state): State<Arc<AppState>>,
    Json(envelope): Json<SyncEnvelope<UserSession>>,
) -> StatusCode {
    state.manager.sessions().apply_sync(envelope);
    StatusCode::OK
}

/// Wire error: `{code, message, request_id}`. The request id is stamped by
/// the correlation middleware.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        let status = match &err {
            ManagerError::NotFound(_) => StatusCode::NOT_FOUND,
            ManagerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ManagerError::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            ManagerError::Conflict(_) => StatusCode::CONFLICT,
            ManagerError::NoStock(_)
            | ManagerError::CsiMountFailed(_)
            | ManagerError::InplaceUpdateTimeout(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ManagerError::Upstream(_) => StatusCode::BAD_GATEWAY,
            ManagerError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ManagerError::Busy => StatusCode::SERVICE_UNAVAILABLE,
            ManagerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %err, "request failed");
        }
        ApiError::new(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "code": self.status.as_u16(),
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

fn chrono_dur(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::max_value())
}
