//! End-to-end tests against the full router with the in-memory cluster
//! backend and, where execution is involved, a fake in-sandbox agent bound
//! to the sandbox's loopback address.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use http::{Request, StatusCode};
use kruise_cluster::object::{
    ANNOTATION_POOL_INIT_RUNTIME, ANNOTATION_SESSION_ID,
};
use kruise_cluster::{ClusterBackend, ClusterObject, MemoryBackend, Sandbox};
use kruise_gateway::server::{build_router, AppConfig, AppState};
use kruise_gateway::{mcp, server};
use kruise_manager::{SandboxManager, SyncEnvelope};
use serde_json::{json, Value};
use tower::ServiceExt;

const ADMIN_KEY: &str = "e2b_admin_test_key";
const MAX_TIMEOUT_SECONDS: u64 = 2_592_000;

fn test_config(enable_auth: bool) -> AppConfig {
    AppConfig {
        listen_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
        session_sync_addr: SocketAddr::from(([0, 0, 0, 0], 8081)),
        mcp_addr: SocketAddr::from(([0, 0, 0, 0], 8082)),
        mcp_enabled: true,
        domain: "example.com".to_string(),
        enable_auth,
        admin_key: Some(ADMIN_KEY.to_string()),
        max_timeout: Duration::from_secs(MAX_TIMEOUT_SECONDS),
        mcp_sandbox_ttl: Duration::from_secs(1800),
        mcp_default_template: "base".to_string(),
        system_namespace: "kruise-system".to_string(),
        peer_selector: "app=kruise-gateway".to_string(),
        self_ip: "10.1.0.1".to_string(),
        max_claim_workers: 16,
        max_create_qps: 50,
    }
}

fn pool_sandbox(name: &str, template: &str) -> ClusterObject {
    let mut sandbox = Sandbox::new("default", name, template);
    sandbox
        .meta
        .annotations
        .insert(ANNOTATION_POOL_INIT_RUNTIME.to_string(), "false".to_string());
    sandbox.spec.cpu_count = 2;
    sandbox.spec.memory_mb = 1024;
    sandbox.spec.disk_size_mb = 4096;
    ClusterObject::Sandbox(sandbox)
}

async fn state_with_pool(names: &[&str], enable_auth: bool) -> Arc<AppState> {
    let backend: Arc<dyn ClusterBackend> = Arc::new(MemoryBackend::reconciling());
    for name in names {
        backend.create(pool_sandbox(name, "base")).await.unwrap();
    }
    state_with_backend(backend, enable_auth, "10.1.0.1").await
}

async fn state_with_backend(
    backend: Arc<dyn ClusterBackend>,
    enable_auth: bool,
    self_ip: &str,
) -> Arc<AppState> {
    let mut config = test_config(enable_auth);
    config.self_ip = self_ip.to_string();
    let manager = SandboxManager::new(backend, config.manager_config()).unwrap();
    manager.start(Some(ADMIN_KEY.to_string())).await.unwrap();
    Arc::new(AppState { manager, config })
}

fn post_json(uri: &str, key: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header(server::API_KEY_HEADER, key)
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get_req(uri: &str, key: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header(server::API_KEY_HEADER, key)
        .body(Body::empty())
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap_or(Value::Null)
}

fn create_body(timeout: u64) -> Value {
    json!({"templateID": "base", "timeout": timeout})
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_creates_respect_stock() {
    let state = state_with_pool(&["sb-1", "sb-2"], true).await;
    let app = build_router(Arc::clone(&state));

    let mut tasks = Vec::new();
    for _ in 0..3 {
        let app = app.clone();
        tasks.push(tokio::spawn(async move {
            app.oneshot(post_json("/sandboxes", ADMIN_KEY, create_body(600)))
                .await
                .unwrap()
        }));
    }

    let mut created = Vec::new();
    let mut no_stock = 0;
    for task in tasks {
        let response = task.await.unwrap();
        match response.status() {
            StatusCode::CREATED => {
                let body = body_json(response).await;
                created.push(body["sandboxID"].as_str().unwrap().to_string());
            }
            StatusCode::INTERNAL_SERVER_ERROR => {
                let body = body_json(response).await;
                assert!(body["message"].as_str().unwrap().contains("no available sandbox"));
                no_stock += 1;
            }
            other => panic!("unexpected status {other}"),
        }
    }
    created.sort();
    created.dedup();
    assert_eq!(created.len(), 2, "both sandboxes claimed exactly once");
    assert_eq!(no_stock, 1);
    state.manager.shutdown();
}

#[tokio::test]
async fn pause_resume_cycle_moves_the_clocks() {
    let state = state_with_pool(&["sb-1"], true).await;
    let app = build_router(Arc::clone(&state));

    let response = app
        .clone()
        .oneshot(post_json(
            "/sandboxes",
            ADMIN_KEY,
            json!({"templateID": "base", "timeout": 300, "autoPause": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    let id = body["sandboxID"].as_str().unwrap().to_string();

    let end_at: chrono::DateTime<Utc> = body["endAt"].as_str().unwrap().parse().unwrap();
    let drift = (end_at - (Utc::now() + chrono::Duration::seconds(300))).num_seconds();
    assert!(drift.abs() <= 5, "endAt must track the requested timeout");

    let response = app
        .clone()
        .oneshot(post_json(&format!("/sandboxes/{id}/pause"), ADMIN_KEY, json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.clone().oneshot(get_req(&format!("/sandboxes/{id}"), ADMIN_KEY)).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["state"], "paused");
    let end_at: chrono::DateTime<Utc> = body["endAt"].as_str().unwrap().parse().unwrap();
    let outer = Utc::now() + chrono::Duration::seconds(MAX_TIMEOUT_SECONDS as i64);
    assert!((end_at - outer).num_seconds().abs() <= 5, "pause widens to the outer bound");

    // Pausing a paused sandbox is a conflict.
    let response = app
        .clone()
        .oneshot(post_json(&format!("/sandboxes/{id}/pause"), ADMIN_KEY, json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = app
        .clone()
        .oneshot(post_json(
            &format!("/sandboxes/{id}/resume"),
            ADMIN_KEY,
            json!({"timeoutSeconds": 300}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.clone().oneshot(get_req(&format!("/sandboxes/{id}"), ADMIN_KEY)).await.unwrap();
    let body = body_json(response).await;
    assert_eq!(body["state"], "running");
    let end_at: chrono::DateTime<Utc> = body["endAt"].as_str().unwrap().parse().unwrap();
    let drift = (end_at - (Utc::now() + chrono::Duration::seconds(300))).num_seconds();
    assert!(drift.abs() <= 5, "resume restores the requested timeout");
    state.manager.shutdown();
}

#[tokio::test]
async fn timeout_and_metadata_validation() {
    let state = state_with_pool(&["sb-1"], true).await;
    let app = build_router(Arc::clone(&state));

    // 29 is below the floor, 30 is accepted.
    let response = app
        .clone()
        .oneshot(post_json("/sandboxes", ADMIN_KEY, create_body(29)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(post_json(
            "/sandboxes",
            ADMIN_KEY,
            json!({"templateID": "base", "timeout": MAX_TIMEOUT_SECONDS + 1}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app
        .clone()
        .oneshot(post_json(
            "/sandboxes",
            ADMIN_KEY,
            json!({"templateID": "base", "timeout": 300, "metadata": {"invalid@key": "x"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["message"].as_str().unwrap().contains("unqualified"));

    let response = app
        .clone()
        .oneshot(post_json(
            "/sandboxes",
            ADMIN_KEY,
            json!({"templateID": "base", "timeout": 300, "metadata": {"e2b.agents.kruise.io/foo": "x"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_json(response).await;
    assert!(body["message"].as_str().unwrap().contains("forbidden"));
    assert!(body["request_id"].is_string(), "errors carry a request id");

    // Unknown template is a 404, valid create with metadata succeeds at 30s.
    let response = app
        .clone()
        .oneshot(post_json(
            "/sandboxes",
            ADMIN_KEY,
            json!({"templateID": "missing", "timeout": 300}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let response = app
        .clone()
        .oneshot(post_json(
            "/sandboxes",
            ADMIN_KEY,
            json!({"templateID": "base", "timeout": 30, "metadata": {"purpose": "ci"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    assert_eq!(body["metadata"]["purpose"], "ci");
    state.manager.shutdown();
}

#[tokio::test]
async fn missing_api_key_is_unauthorized() {
    let state = state_with_pool(&["sb-1"], true).await;
    let app = build_router(Arc::clone(&state));

    let request = Request::builder()
        .method("POST")
        .uri("/sandboxes")
        .header("content-type", "application/json")
        .body(Body::from(create_body(300).to_string()))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    state.manager.shutdown();
}

#[tokio::test]
async fn inplace_update_extension_lands_before_response() {
    let state = state_with_pool(&["sb-1"], true).await;
    let app = build_router(Arc::clone(&state));

    let response = app
        .oneshot(post_json(
            "/sandboxes",
            ADMIN_KEY,
            json!({
                "templateID": "base",
                "timeout": 300,
                "metadata": {"e2b.agents.kruise.io/image": "registry.example/base:v2"}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    let id = body["sandboxID"].as_str().unwrap();

    let sandbox = state.manager.cache().sandbox(id).unwrap();
    assert_eq!(sandbox.spec.image, "registry.example/base:v2");
    assert_eq!(sandbox.status.image, "registry.example/base:v2");
    state.manager.shutdown();
}

#[tokio::test]
async fn list_filters_by_owner_state_and_metadata() {
    let state = state_with_pool(&["sb-1", "sb-2"], true).await;
    let app = build_router(Arc::clone(&state));

    let user_key = state
        .manager
        .keys()
        .create_key("user-1", "test")
        .await
        .unwrap()
        .key;

    let response = app
        .clone()
        .oneshot(post_json(
            "/sandboxes",
            &user_key,
            json!({"templateID": "base", "timeout": 300, "metadata": {"purpose": "ci"}}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // The other user sees nothing; the owner and the admin each see one.
    let other_key = state
        .manager
        .keys()
        .create_key("user-2", "test")
        .await
        .unwrap()
        .key;
    let body = body_json(
        app.clone()
            .oneshot(get_req("/v2/sandboxes", &other_key))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body.as_array().unwrap().len(), 0);

    let body = body_json(
        app.clone()
            .oneshot(get_req("/v2/sandboxes", &user_key))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    let body = body_json(
        app.clone()
            .oneshot(get_req("/v2/sandboxes?metadata=purpose%3Dci", &user_key))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body.as_array().unwrap().len(), 1);

    let body = body_json(
        app.clone()
            .oneshot(get_req("/v2/sandboxes?metadata=purpose%3Dother", &user_key))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body.as_array().unwrap().len(), 0);

    let body = body_json(
        app.clone()
            .oneshot(get_req("/v2/sandboxes?state=paused", &user_key))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(body.as_array().unwrap().len(), 0);
    state.manager.shutdown();
}

#[tokio::test]
async fn path_based_api_variant_serves_the_same_endpoints() {
    let state = state_with_pool(&["sb-1"], true).await;
    let app = build_router(Arc::clone(&state));

    let response = app
        .clone()
        .oneshot(post_json("/kruise/api/sandboxes", ADMIN_KEY, create_body(300)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    let id = body["sandboxID"].as_str().unwrap();

    let response = app
        .clone()
        .oneshot(get_req(&format!("/kruise/api/sandboxes/{id}"), ADMIN_KEY))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    state.manager.shutdown();
}

#[tokio::test]
async fn delete_retracts_route_and_later_requests_404() {
    let state = state_with_pool(&["sb-1"], true).await;
    let app = build_router(Arc::clone(&state));

    let body = body_json(
        app.clone()
            .oneshot(post_json("/sandboxes", ADMIN_KEY, create_body(300)))
            .await
            .unwrap(),
    )
    .await;
    let id = body["sandboxID"].as_str().unwrap().to_string();
    assert!(state.manager.routes().get(&id).is_some());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/sandboxes/{id}"))
                .header(server::API_KEY_HEADER, ADMIN_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(state.manager.routes().get(&id).is_none());

    // Proxying to the dead sandbox now fails with 404.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!("/kruise/{id}/3000/index.html"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // The watch delete propagates through the dispatch task.
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    let response = app
        .oneshot(get_req(&format!("/sandboxes/{id}"), ADMIN_KEY))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    state.manager.shutdown();
}

#[tokio::test]
async fn replicated_route_forwards_to_the_owning_peer() {
    let backend: Arc<dyn ClusterBackend> = Arc::new(MemoryBackend::reconciling());
    backend.create(pool_sandbox("sb-1", "base")).await.unwrap();

    let replica_a = state_with_backend(Arc::clone(&backend), true, "10.1.0.1").await;
    let replica_b = state_with_backend(Arc::clone(&backend), true, "10.1.0.2").await;

    let app_a = build_router(Arc::clone(&replica_a));
    let body = body_json(
        app_a
            .oneshot(post_json("/sandboxes", ADMIN_KEY, create_body(300)))
            .await
            .unwrap(),
    )
    .await;
    let id = body["sandboxID"].as_str().unwrap().to_string();

    // Replica B receives the route via the sync endpoint.
    let record = replica_a.manager.routes().get(&id).unwrap();
    let app_b = build_router(Arc::clone(&replica_b));
    let response = app_b
        .clone()
        .oneshot(post_json(
            "/route/sync",
            ADMIN_KEY,
            serde_json::to_value(SyncEnvelope {
                record: record.clone(),
                deleted: false,
            })
            .unwrap(),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let decision = replica_b
        .manager
        .router()
        .decide("ignored", &format!("/kruise/{id}/3000/app"), None)
        .unwrap()
        .unwrap();
    assert_eq!(
        decision.upstream,
        kruise_manager::UpstreamHost::Peer {
            host: "10.1.0.1:8080".to_string()
        }
    );

    replica_a.manager.shutdown();
    replica_b.manager.shutdown();
}

#[tokio::test]
async fn proxy_streams_from_a_local_sandbox() {
    let state = state_with_pool(&["sb-proxy"], true).await;
    let app = build_router(Arc::clone(&state));

    let body = body_json(
        app.clone()
            .oneshot(post_json("/sandboxes", ADMIN_KEY, create_body(300)))
            .await
            .unwrap(),
    )
    .await;
    let id = body["sandboxID"].as_str().unwrap().to_string();
    let sandbox = state.manager.cache().sandbox(&id).unwrap();

    // A fake app listens on the sandbox's loopback address.
    let upstream = Router::new().route("/hello", get(|| async { "hello from sandbox" }));
    let listener =
        tokio::net::TcpListener::bind(format!("{}:0", sandbox.status.ip))
            .await
            .unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        axum::serve(listener, upstream).await.unwrap();
    });

    let response = app
        .oneshot(
            Request::builder()
                .uri(format!("/kruise/{id}/{port}/hello"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
    assert_eq!(&bytes[..], b"hello from sandbox");
    state.manager.shutdown();
}

#[tokio::test]
async fn api_key_lifecycle() {
    let state = state_with_pool(&["sb-1"], true).await;
    let app = build_router(Arc::clone(&state));

    let response = app
        .clone()
        .oneshot(post_json("/api-keys", ADMIN_KEY, json!({"name": "ci"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = body_json(response).await;
    let key_id = body["id"].as_str().unwrap().to_string();
    assert!(body["key"].as_str().unwrap().starts_with("e2b_"));

    let body = body_json(
        app.clone()
            .oneshot(get_req("/api-keys", ADMIN_KEY))
            .await
            .unwrap(),
    )
    .await;
    let listed = body.as_array().unwrap();
    assert!(listed.iter().any(|k| k["id"] == key_id.as_str()));
    assert!(listed.iter().all(|k| k.get("key").is_none()), "listings never echo key material");

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri(format!("/api-keys/{key_id}"))
                .header(server::API_KEY_HEADER, ADMIN_KEY)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    state.manager.shutdown();
}

/// Fake in-sandbox agent: code exec on one listener, process API on another.
async fn spawn_fake_agent(ip: &str) {
    let execute = Router::new().route(
        "/execute",
        post(|| async {
            let lines = [
                json!({"type": "stdout", "text": "hello"}).to_string(),
                json!({"type": "result", "data": {"text/plain": "42"}}).to_string(),
                json!({"type": "number_of_executions", "data": 1}).to_string(),
            ]
            .join("\n");
            lines
        }),
    );
    let control = Router::new().route(
        "/process/start",
        post(|| async {
            Json(json!({"stdout": "ran fine", "stderr": "", "exit_code": 0}))
        }),
    );

    let exec_listener = tokio::net::TcpListener::bind(format!("{ip}:49999")).await.unwrap();
    let control_listener = tokio::net::TcpListener::bind(format!("{ip}:49982")).await.unwrap();
    tokio::spawn(async move {
        axum::serve(exec_listener, execute).await.unwrap();
    });
    tokio::spawn(async move {
        axum::serve(control_listener, control).await.unwrap();
    });
}

fn mcp_call(key: &str, session: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri("/mcp")
        .header("content-type", "application/json")
        .header(server::API_KEY_HEADER, key);
    if let Some(session) = session {
        builder = builder.header(mcp::SESSION_HEADER, session);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn run_code_request(code: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "tools/call",
        "params": {"name": "run_code", "arguments": {"code": code, "language": "python"}}
    })
}

#[tokio::test]
async fn mcp_session_reuses_one_sandbox_and_rejects_cross_user() {
    let state = state_with_pool(&["sb-mcp"], true).await;
    let app = mcp::build_router(Arc::clone(&state));

    let u1_key = state.manager.keys().create_key("u1", "t").await.unwrap().key;
    let u2_key = state.manager.keys().create_key("u2", "t").await.unwrap().key;

    // The fake agent must listen before the first tool call executes code.
    let pool = state.manager.cache().sandboxes_by_template("base");
    spawn_fake_agent(&pool[0].status.ip).await;

    let response = app
        .clone()
        .oneshot(mcp_call(&u1_key, Some("s1"), run_code_request("print(1)")))
        .await
        .unwrap();
    let body = body_json(response).await;
    let text = body["result"]["content"][0]["text"].as_str().unwrap();
    let payload: Value = serde_json::from_str(text).unwrap();
    let first_sandbox = payload["sandbox_id"].as_str().unwrap().to_string();
    assert_eq!(payload["logs"]["stdout"][0], "hello");
    assert_eq!(payload["execution_count"], 1);

    // Second call on the same session reuses the sandbox even though the
    // pool is now empty.
    let response = app
        .clone()
        .oneshot(mcp_call(&u1_key, Some("s1"), run_code_request("print(2)")))
        .await
        .unwrap();
    let body = body_json(response).await;
    let text = body["result"]["content"][0]["text"].as_str().unwrap();
    let payload: Value = serde_json::from_str(text).unwrap();
    assert_eq!(payload["sandbox_id"].as_str().unwrap(), first_sandbox);

    // A different user on the same session id is rejected.
    let response = app
        .clone()
        .oneshot(mcp_call(&u2_key, Some("s1"), run_code_request("print(3)")))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32001);
    state.manager.shutdown();
}

#[tokio::test]
async fn mcp_rejects_unsupported_language() {
    let state = state_with_pool(&["sb-1"], true).await;
    let app = mcp::build_router(Arc::clone(&state));

    let response = app
        .oneshot(mcp_call(
            ADMIN_KEY,
            Some("s1"),
            json!({
                "jsonrpc": "2.0",
                "id": 1,
                "method": "tools/call",
                "params": {"name": "run_code", "arguments": {"code": "x", "language": "cobol"}}
            }),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["error"]["code"], -32003);
    state.manager.shutdown();
}

#[tokio::test]
async fn mcp_run_command_returns_process_output() {
    let state = state_with_pool(&["sb-cmd"], true).await;
    let app = mcp::build_router(Arc::clone(&state));

    let pool = state.manager.cache().sandboxes_by_template("base");
    spawn_fake_agent(&pool[0].status.ip).await;

    let response = app
        .oneshot(mcp_call(
            ADMIN_KEY,
            Some("s-cmd"),
            json!({
                "jsonrpc": "2.0",
                "id": 7,
                "method": "tools/call",
                "params": {"name": "run_command", "arguments": {"cmd": "echo hi"}}
            }),
        ))
        .await
        .unwrap();
    let body = body_json(response).await;
    let text = body["result"]["content"][0]["text"].as_str().unwrap();
    let payload: Value = serde_json::from_str(text).unwrap();
    assert_eq!(payload["stdout"], "ran fine");
    assert_eq!(payload["exitCode"], 0);
    state.manager.shutdown();
}

#[tokio::test]
async fn mcp_initialize_hands_out_a_session() {
    let state = state_with_pool(&["sb-1"], true).await;
    let app = mcp::build_router(Arc::clone(&state));

    let response = app
        .oneshot(mcp_call(
            ADMIN_KEY,
            None,
            json!({"jsonrpc": "2.0", "id": 0, "method": "initialize", "params": {}}),
        ))
        .await
        .unwrap();
    assert!(response.headers().contains_key(mcp::SESSION_HEADER));
    let body = body_json(response).await;
    assert_eq!(body["result"]["serverInfo"]["name"], "kruise-gateway");
    state.manager.shutdown();
}

#[tokio::test]
async fn session_annotation_is_stamped_on_the_sandbox() {
    let state = state_with_pool(&["sb-1"], true).await;
    let sessions = state.manager.sessions();
    let session = sessions
        .get_or_create("s1", "u1", "base", Duration::from_secs(600))
        .await
        .unwrap();
    let sandbox = state.manager.cache().sandbox(&session.sandbox_id).unwrap();
    assert_eq!(
        sandbox.meta.annotations.get(ANNOTATION_SESSION_ID).unwrap(),
        "s1"
    );
    state.manager.shutdown();
}

#[tokio::test]
async fn healthz_and_metrics_respond() {
    let state = state_with_pool(&[], true).await;
    let app = build_router(Arc::clone(&state));

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    state.manager.shutdown();
}
