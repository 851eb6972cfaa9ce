//! Admission control for cluster-touching requests.
//!
//! The cluster store is shared by every replica, so the operations that
//! patch it are the ones worth defending: claims allocate out of a finite
//! pool, lifecycle changes and MCP tool calls write through to the store.
//! Reads, the sandbox proxy and the replica-to-replica endpoints are
//! never throttled.
//!
//! Each caller identity holds one token bucket and operations drain it at
//! different costs, so a burst of claims exhausts an identity long before
//! the same number of pause calls would. Buckets refill lazily on access;
//! untouched ones are swept out once they have fully refilled.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{header, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::time::Instant;
use tracing::warn;

const API_KEY_HEADER: &str = "x-api-key";

/// An untouched bucket has refilled completely after this long; keeping it
/// any further only grows the map.
const IDLE_EVICTION: Duration = Duration::from_secs(600);
/// Admissions between eviction sweeps.
const SWEEP_INTERVAL: u64 = 512;

/// What a guarded request costs, in bucket tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationClass {
    /// Takes a sandbox out of a shared pool.
    Claim,
    /// Patches an existing sandbox or the key secret: pause, resume,
    /// timeout, kill, key create/delete.
    Lifecycle,
    /// MCP tool call; executes in a sandbox and may claim one.
    ToolCall,
}

impl OperationClass {
    fn cost(self) -> f64 {
        match self {
            OperationClass::Claim => 10.0,
            OperationClass::Lifecycle => 2.0,
            OperationClass::ToolCall => 5.0,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            OperationClass::Claim => "claim",
            OperationClass::Lifecycle => "lifecycle",
            OperationClass::ToolCall => "tool-call",
        }
    }
}

/// Classifies a request. `None` passes unthrottled.
fn classify(method: &Method, path: &str) -> Option<OperationClass> {
    let path = path.strip_prefix("/kruise/api").unwrap_or(path);

    if path == "/mcp" {
        return (*method == Method::POST).then_some(OperationClass::ToolCall);
    }
    if path == "/sandboxes" {
        return (*method == Method::POST).then_some(OperationClass::Claim);
    }
    if let Some(rest) = path.strip_prefix("/sandboxes/") {
        // Single-sandbox reads stay free; connect and resume only patch a
        // sandbox that already exists.
        let mutating = *method == Method::POST || *method == Method::DELETE;
        return (mutating && !rest.is_empty()).then_some(OperationClass::Lifecycle);
    }
    if path.starts_with("/api-keys") {
        let mutating = *method == Method::POST || *method == Method::DELETE;
        return mutating.then_some(OperationClass::Lifecycle);
    }
    None
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Steady-state refill per identity, in tokens per minute.
    pub tokens_per_minute: u32,
    /// Bucket capacity; bounds the largest burst one identity can land.
    pub burst_tokens: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_minute: 600,
            burst_tokens: 60,
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    touched: Instant,
}

pub struct RateLimiter {
    refill_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<u64, Bucket>>,
    admissions: AtomicU64,
}

impl RateLimiter {
    pub fn shared(config: RateLimitConfig) -> Arc<Self> {
        Arc::new(Self {
            refill_per_sec: f64::from(config.tokens_per_minute.max(1)) / 60.0,
            capacity: f64::from(config.burst_tokens.max(1)),
            buckets: Mutex::new(HashMap::new()),
            admissions: AtomicU64::new(0),
        })
    }

    /// Charges the operation to the identity's bucket. On refusal the
    /// caller learns how long until the charge would fit.
    fn admit(&self, identity: u64, class: OperationClass) -> Result<(), Duration> {
        if self.admissions.fetch_add(1, Ordering::Relaxed) % SWEEP_INTERVAL == 0 {
            self.sweep_idle();
        }

        let cost = class.cost();
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(identity).or_insert(Bucket {
            tokens: self.capacity,
            touched: now,
        });

        let elapsed = now.duration_since(bucket.touched).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.touched = now;

        if bucket.tokens >= cost {
            bucket.tokens -= cost;
            Ok(())
        } else {
            let deficit = cost - bucket.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }

    /// Drops buckets untouched long enough to have fully refilled.
    fn sweep_idle(&self) {
        let now = Instant::now();
        self.buckets
            .lock()
            .retain(|_, bucket| now.duration_since(bucket.touched) <= IDLE_EVICTION);
    }
}

/// Identities are the API key when present, one shared bucket for
/// anonymous callers otherwise. Only a hash of the key is retained.
fn identity_of(request: &Request) -> u64 {
    let mut hasher = DefaultHasher::new();
    match request
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        Some(key) => key.hash(&mut hasher),
        None => "anonymous".hash(&mut hasher),
    }
    hasher.finish()
}

pub async fn enforce(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(class) = classify(request.method(), request.uri().path()) else {
        return next.run(request).await;
    };

    match limiter.admit(identity_of(&request), class) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            let seconds = retry_after.as_secs().max(1);
            warn!(
                operation = class.as_str(),
                retry_after_seconds = seconds,
                "request refused by admission control"
            );
            let body = json!({
                "code": StatusCode::TOO_MANY_REQUESTS.as_u16(),
                "message": format!("{} rate exceeded, retry in {seconds}s", class.as_str()),
            });
            let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
            if let Ok(value) = header::HeaderValue::from_str(&seconds.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_cluster_mutations_are_guarded() {
        assert_eq!(classify(&Method::POST, "/sandboxes"), Some(OperationClass::Claim));
        assert_eq!(
            classify(&Method::POST, "/kruise/api/sandboxes"),
            Some(OperationClass::Claim)
        );
        assert_eq!(
            classify(&Method::POST, "/sandboxes/default--sb-1/pause"),
            Some(OperationClass::Lifecycle)
        );
        assert_eq!(
            classify(&Method::DELETE, "/sandboxes/default--sb-1"),
            Some(OperationClass::Lifecycle)
        );
        assert_eq!(classify(&Method::POST, "/mcp"), Some(OperationClass::ToolCall));
        assert_eq!(classify(&Method::POST, "/api-keys"), Some(OperationClass::Lifecycle));

        assert_eq!(classify(&Method::GET, "/sandboxes/default--sb-1"), None);
        assert_eq!(classify(&Method::GET, "/v2/sandboxes"), None);
        assert_eq!(classify(&Method::GET, "/api-keys"), None);
        assert_eq!(classify(&Method::GET, "/mcp"), None);
        assert_eq!(classify(&Method::POST, "/route/sync"), None);
        assert_eq!(classify(&Method::GET, "/kruise/sb-1/3000/app"), None);
        assert_eq!(classify(&Method::GET, "/healthz"), None);
    }

    #[tokio::test]
    async fn burst_is_bounded_and_refills() {
        tokio::time::pause();
        let limiter = RateLimiter::shared(RateLimitConfig {
            tokens_per_minute: 60,
            burst_tokens: 20,
        });

        // Twenty tokens buy exactly two claims.
        limiter.admit(1, OperationClass::Claim).unwrap();
        limiter.admit(1, OperationClass::Claim).unwrap();
        let retry = limiter.admit(1, OperationClass::Claim).unwrap_err();
        assert!(retry > Duration::ZERO);

        // One token per second: a claim fits again after ten.
        tokio::time::sleep(Duration::from_secs(10)).await;
        limiter.admit(1, OperationClass::Claim).unwrap();
    }

    #[tokio::test]
    async fn identities_do_not_share_buckets() {
        let limiter = RateLimiter::shared(RateLimitConfig {
            tokens_per_minute: 60,
            burst_tokens: 10,
        });
        limiter.admit(1, OperationClass::Claim).unwrap();
        limiter.admit(1, OperationClass::Claim).unwrap_err();
        limiter.admit(2, OperationClass::Claim).unwrap();
    }

    #[tokio::test]
    async fn cheap_operations_drain_slower_than_claims() {
        let limiter = RateLimiter::shared(RateLimitConfig {
            tokens_per_minute: 60,
            burst_tokens: 10,
        });
        // Five lifecycle patches fit in the budget one claim empties.
        for _ in 0..5 {
            limiter.admit(1, OperationClass::Lifecycle).unwrap();
        }
        limiter.admit(1, OperationClass::Lifecycle).unwrap_err();

        limiter.admit(2, OperationClass::Claim).unwrap();
        limiter.admit(2, OperationClass::Lifecycle).unwrap_err();
    }

    #[tokio::test]
    async fn idle_buckets_are_swept() {
        tokio::time::pause();
        let limiter = RateLimiter::shared(RateLimitConfig::default());
        limiter.admit(1, OperationClass::Lifecycle).unwrap();
        assert_eq!(limiter.buckets.lock().len(), 1);

        tokio::time::sleep(IDLE_EVICTION + Duration::from_secs(1)).await;
        limiter.sweep_idle();
        assert!(limiter.buckets.lock().is_empty());
    }
}
