//! The claim engine: atomically reserves a ready sandbox from a pool and
//! turns it into a user-owned one.
//!
//! Claims within one pool are serialized by the pool's claim lock; the
//! reservation set is the single authority between "chosen" and "patch
//! confirmed", so two concurrent claims can never pick the same sandbox.
//! A process-wide worker semaphore bounds in-flight claims and a token
//! bucket rate-limits patch traffic against the cluster store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use chrono::Utc;
use kruise_cluster::object::{ANNOTATION_CLAIMED_AT, ANNOTATION_CSI_PUBLISH};
use kruise_cluster::{mutate_sandbox, Cache, ConditionKind, Sandbox};
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tracing::{info, instrument, warn};

use crate::agent::AgentClient;
use crate::csi::CsiMounter;
use crate::error::ManagerError;
use crate::pool::PoolSet;

pub const DEFAULT_MAX_CLAIM_WORKERS: usize = 16;
pub const DEFAULT_MAX_CREATE_QPS: u32 = 50;
const DEFAULT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct InitRuntimeOptions {
    pub env_vars: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct InplaceUpdateOptions {
    pub image: String,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CsiMountOptions {
    pub volume_name: String,
    pub mount_point: String,
}

/// One claim request. The modifier runs against a deep copy of the chosen
/// sandbox and stamps ownership details (timeout clocks, access token,
/// user metadata); the engine itself sets the owner and claim timestamp.
pub struct ClaimOptions {
    pub user: String,
    pub template: String,
    pub modifier: Box<dyn Fn(&mut Sandbox) + Send + Sync>,
    pub init_runtime: Option<InitRuntimeOptions>,
    pub inplace_update: Option<InplaceUpdateOptions>,
    pub csi_mount: Option<CsiMountOptions>,
    /// Leave a failed sandbox orphaned for inspection instead of killing it.
    pub reserve_failed_sandbox: bool,
}

impl ClaimOptions {
    pub fn new(user: &str, template: &str) -> Self {
        Self {
            user: user.to_string(),
            template: template.to_string(),
            modifier: Box::new(|_| {}),
            init_runtime: None,
            inplace_update: None,
            csi_mount: None,
            reserve_failed_sandbox: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClaimEngineConfig {
    pub max_workers: usize,
    pub patch_qps: u32,
    /// How long a caller may wait for a worker slot before `Busy`.
    pub admission_wait: Duration,
    /// Window for the reconciler to flip `ClaimAccepted`.
    pub confirm_timeout: Duration,
}

impl Default for ClaimEngineConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_CLAIM_WORKERS,
            patch_qps: DEFAULT_MAX_CREATE_QPS,
            admission_wait: Duration::from_secs(10),
            confirm_timeout: DEFAULT_CONFIRM_TIMEOUT,
        }
    }
}

pub struct ClaimEngine {
    cache: Arc<Cache>,
    pools: Arc<PoolSet>,
    agent: AgentClient,
    csi: Arc<CsiMounter>,
    workers: Arc<Semaphore>,
    patch_tokens: TokenBucket,
    config: ClaimEngineConfig,
}

impl ClaimEngine {
    pub fn new(
        cache: Arc<Cache>,
        pools: Arc<PoolSet>,
        agent: AgentClient,
        csi: Arc<CsiMounter>,
        config: ClaimEngineConfig,
    ) -> Self {
        let workers = Arc::new(Semaphore::new(config.max_workers));
        let patch_tokens = TokenBucket::new(config.patch_qps);
        Self {
            cache,
            pools,
            agent,
            csi,
            workers,
            patch_tokens,
            config,
        }
    }

    /// Claims one sandbox for `options.user`. On success the sandbox is
    /// owned, confirmed by the reconciler and ready for traffic.
    #[instrument(skip(self, options), fields(user = %options.user, template = %options.template))]
    pub async fn claim(&self, options: ClaimOptions) -> Result<Sandbox, ManagerError> {
        let pool = self.pools.resolve(&options.template)?;

        let _permit = tokio::time::timeout(self.config.admission_wait, self.workers.acquire())
            .await
            .map_err(|_| ManagerError::Busy)?
            .map_err(|_| ManagerError::Internal(anyhow::anyhow!("claim semaphore closed")))?;

        // Pick and reserve under the pool lock; everything afterwards is
        // per-sandbox and runs without it.
        let chosen = {
            let _guard = pool.lock_claims().await;
            let available = pool.available(&self.cache);
            let Some(candidate) = available.into_iter().next() else {
                return Err(ManagerError::NoStock(options.template.clone()));
            };
            pool.reserve(&candidate.id());
            candidate
        };

        let key = chosen.id();
        let result = self.claim_reserved(&key, &options, pool.flags().init_runtime).await;
        pool.release(&key);

        match result {
            Ok(sandbox) => {
                info!(sandbox_id = %key, user = %options.user, "sandbox claimed");
                Ok(sandbox)
            }
            Err(err) => {
                self.cleanup_failed(&key, options.reserve_failed_sandbox, &err).await;
                Err(err)
            }
        }
    }

    async fn claim_reserved(
        &self,
        key: &str,
        options: &ClaimOptions,
        pool_wants_init: bool,
    ) -> Result<Sandbox, ManagerError> {
        let backend = self.cache.backend();
        let expectations = self.cache.expectations();

        // Ownership patch.
        self.patch_tokens.acquire().await;
        let user = options.user.clone();
        let (claimed, _rv) = mutate_sandbox(backend, expectations, key, |s| {
            if !s.owner().is_empty() && s.owner() != user {
                // The reservation should make this impossible; treat it as
                // a hard conflict rather than stealing the sandbox.
                return Err(kruise_cluster::ClusterError::Conflict(s.id()));
            }
            (options.modifier)(s);
            s.set_owner(&user);
            s.meta
                .annotations
                .insert(ANNOTATION_CLAIMED_AT.to_string(), Utc::now().to_rfc3339());
            Ok(())
        })
        .await?;

        // The claim is not durable until the reconciler accepts it.
        self.cache
            .wait_sandbox(key, self.config.confirm_timeout, |s| {
                s.condition(ConditionKind::ClaimAccepted)
            })
            .await?
            .ok_or_else(|| ManagerError::NotFound(format!("sandbox {key} vanished during claim")))?;

        if let Some(update) = &options.inplace_update {
            self.inplace_update(key, update).await?;
        }

        if pool_wants_init {
            if let Some(init) = &options.init_runtime {
                self.agent
                    .init(&claimed.status.ip, &init.env_vars, claimed.access_token())
                    .await?;
            }
        }

        if let Some(mount) = &options.csi_mount {
            let encoded = self
                .csi
                .encoded_publish_request(&mount.volume_name, &mount.mount_point)?;
            self.patch_tokens.acquire().await;
            mutate_sandbox(backend, expectations, key, |s| {
                s.meta
                    .annotations
                    .insert(ANNOTATION_CSI_PUBLISH.to_string(), encoded.clone());
                Ok(())
            })
            .await
            .map_err(|err| ManagerError::CsiMountFailed(err.to_string()))?;
        }

        self.cache
            .sandbox(key)
            .ok_or_else(|| ManagerError::NotFound(format!("sandbox {key} vanished during claim")))
    }

    async fn inplace_update(
        &self,
        key: &str,
        update: &InplaceUpdateOptions,
    ) -> Result<(), ManagerError> {
        let backend = self.cache.backend();
        let expectations = self.cache.expectations();

        self.patch_tokens.acquire().await;
        let image = update.image.clone();
        mutate_sandbox(backend, expectations, key, |s| {
            s.spec.image = image.clone();
            Ok(())
        })
        .await?;

        let wanted = update.image.clone();
        let confirmed = self
            .cache
            .wait_sandbox(key, update.timeout, move |s| {
                s.condition(ConditionKind::Ready) && s.status.image == wanted
            })
            .await;
        match confirmed {
            Ok(Some(_)) => Ok(()),
            Ok(None) => Err(ManagerError::NotFound(format!(
                "sandbox {key} vanished during inplace update"
            ))),
            Err(_) => Err(ManagerError::InplaceUpdateTimeout(key.to_string())),
        }
    }

    async fn cleanup_failed(&self, key: &str, reserve_failed: bool, err: &ManagerError) {
        if reserve_failed {
            warn!(sandbox_id = %key, error = %err, "claim failed, sandbox kept for inspection");
            return;
        }
        // A conflict on the ownership patch means the sandbox was never
        // ours; unreserving is enough.
        if matches!(err, ManagerError::Conflict(_)) {
            warn!(sandbox_id = %key, error = %err, "claim lost the ownership patch");
            return;
        }
        // Everything past the ownership patch leaves a half-claimed sandbox
        // that must not return to the pool.
        if let Err(kill_err) = self
            .cache
            .backend()
            .mark_deleted(kruise_cluster::Kind::Sandbox, key)
            .await
        {
            warn!(sandbox_id = %key, error = %kill_err, "failed to kill sandbox after claim failure");
        } else {
            warn!(sandbox_id = %key, error = %err, "claim failed, sandbox killed");
        }
    }
}

/// Minimal token bucket for patch-call throttling. Callers park until a
/// token is available; fairness comes from the tokio timer queue.
pub struct TokenBucket {
    state: Mutex<BucketState>,
    rate: f64,
    burst: f64,
}

struct BucketState {
    tokens: f64,
    refreshed: Instant,
}

impl TokenBucket {
    pub fn new(per_second: u32) -> Self {
        let rate = per_second.max(1) as f64;
        Self {
            state: Mutex::new(BucketState {
                tokens: rate,
                refreshed: Instant::now(),
            }),
            rate,
            burst: rate,
        }
    }

    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                let now = Instant::now();
                let elapsed = now.duration_since(state.refreshed).as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
                state.refreshed = now;
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                Duration::from_secs_f64((1.0 - state.tokens) / self.rate)
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kruise_cluster::{ClusterBackend, ClusterObject, Kind, MemoryBackend};
    use std::collections::HashSet;

    async fn engine_with_config(
        names: &[&str],
        config: ClaimEngineConfig,
    ) -> (Arc<Cache>, Arc<ClaimEngine>) {
        let backend: Arc<dyn ClusterBackend> = Arc::new(MemoryBackend::reconciling());
        for name in names {
            backend
                .create(ClusterObject::Sandbox(Sandbox::new("default", name, "base")))
                .await
                .unwrap();
        }
        let cache = Cache::new(backend);
        cache.start().await.unwrap();
        let pools = Arc::new(PoolSet::new(
            Arc::clone(&cache),
            crate::pool::DEFAULT_CLAIM_LOCK_TIMEOUT,
        ));
        let csi = Arc::new(CsiMounter::new(Arc::clone(&cache)));
        let engine = Arc::new(ClaimEngine::new(
            Arc::clone(&cache),
            pools,
            AgentClient::new(Duration::from_secs(5)).unwrap(),
            csi,
            config,
        ));
        (cache, engine)
    }

    async fn engine_with_pool(names: &[&str]) -> (Arc<Cache>, Arc<ClaimEngine>) {
        engine_with_config(names, ClaimEngineConfig::default()).await
    }

    #[tokio::test]
    async fn concurrent_claims_never_exceed_stock() {
        let (_cache, engine) = engine_with_pool(&["sb-1", "sb-2"]).await;

        let mut tasks = Vec::new();
        for i in 0..3 {
            let engine = Arc::clone(&engine);
            tasks.push(tokio::spawn(async move {
                engine
                    .claim(ClaimOptions::new(&format!("user-{i}"), "base"))
                    .await
            }));
        }

        let mut claimed = HashSet::new();
        let mut no_stock = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(sandbox) => {
                    assert!(claimed.insert(sandbox.id()), "sandbox claimed twice");
                }
                Err(ManagerError::NoStock(template)) => {
                    assert_eq!(template, "base");
                    no_stock += 1;
                }
                Err(other) => panic!("unexpected claim error: {other}"),
            }
        }
        assert_eq!(claimed.len(), 2);
        assert_eq!(no_stock, 1);
    }

    #[tokio::test]
    async fn claim_stamps_owner_and_confirmation() {
        let (_cache, engine) = engine_with_pool(&["sb-1"]).await;

        let mut options = ClaimOptions::new("user-1", "base");
        options.modifier = Box::new(|s: &mut Sandbox| {
            s.meta.annotations.insert(
                "agents.kruise.io/access-token".to_string(),
                "tok-123".to_string(),
            );
        });
        let sandbox = engine.claim(options).await.unwrap();

        assert_eq!(sandbox.owner(), "user-1");
        assert_eq!(sandbox.access_token(), "tok-123");
        assert!(sandbox.condition(ConditionKind::ClaimAccepted));
        assert!(sandbox
            .meta
            .annotations
            .contains_key(ANNOTATION_CLAIMED_AT));

        // The claimed sandbox no longer counts as stock.
        let err = engine
            .claim(ClaimOptions::new("user-2", "base"))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::NoStock(_)));
    }

    #[tokio::test]
    async fn unknown_template_is_not_found() {
        let (_cache, engine) = engine_with_pool(&["sb-1"]).await;
        let err = engine
            .claim(ClaimOptions::new("user-1", "missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::NotFound(_)));
    }

    #[tokio::test]
    async fn inplace_update_lands_before_return() {
        let (_cache, engine) = engine_with_pool(&["sb-1"]).await;

        let mut options = ClaimOptions::new("user-1", "base");
        options.inplace_update = Some(InplaceUpdateOptions {
            image: "registry.example/base:v2".to_string(),
            timeout: Duration::from_secs(5),
        });
        let sandbox = engine.claim(options).await.unwrap();
        assert_eq!(sandbox.spec.image, "registry.example/base:v2");
        assert_eq!(sandbox.status.image, "registry.example/base:v2");
        assert!(sandbox.condition(ConditionKind::Ready));
    }

    #[tokio::test]
    async fn failed_init_kills_the_sandbox() {
        let (cache, engine) = engine_with_pool(&["sb-1"]).await;

        // No agent listens on the synthesized loopback address, so /init
        // is refused and the claim must fail closed.
        let mut options = ClaimOptions::new("user-1", "base");
        options.init_runtime = Some(InitRuntimeOptions {
            env_vars: HashMap::new(),
        });
        let err = engine.claim(options).await.unwrap_err();
        assert!(matches!(err, ManagerError::Upstream(_) | ManagerError::Timeout(_)));

        let gone = cache
            .backend()
            .get(Kind::Sandbox, "default--sb-1")
            .await
            .unwrap();
        assert!(gone.is_none(), "failed sandbox must be killed");
    }

    #[tokio::test]
    async fn reserve_failed_sandbox_keeps_the_orphan() {
        let (cache, engine) = engine_with_pool(&["sb-1"]).await;

        let mut options = ClaimOptions::new("user-1", "base");
        options.init_runtime = Some(InitRuntimeOptions {
            env_vars: HashMap::new(),
        });
        options.reserve_failed_sandbox = true;
        engine.claim(options).await.unwrap_err();

        let kept = cache
            .backend()
            .get(Kind::Sandbox, "default--sb-1")
            .await
            .unwrap();
        assert!(kept.is_some(), "orphan must be kept for inspection");
    }

    #[tokio::test]
    async fn saturated_workers_return_busy() {
        let (_cache, engine) = engine_with_config(
            &["sb-1"],
            ClaimEngineConfig {
                max_workers: 1,
                admission_wait: Duration::from_millis(50),
                ..ClaimEngineConfig::default()
            },
        )
        .await;

        let hog = engine.workers.clone().acquire_owned().await.unwrap();
        let err = engine
            .claim(ClaimOptions::new("user-1", "base"))
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::Busy));
        drop(hog);

        engine.claim(ClaimOptions::new("user-1", "base")).await.unwrap();
    }

    #[tokio::test]
    async fn token_bucket_throttles_beyond_burst() {
        tokio::time::pause();
        let bucket = TokenBucket::new(10);
        for _ in 0..10 {
            bucket.acquire().await;
        }
        let start = tokio::time::Instant::now();
        bucket.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(90));
    }
}
