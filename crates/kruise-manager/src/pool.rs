//! Per-template pools of pre-warmed sandboxes.
//!
//! A pool does not own sandbox objects; membership is derived from the
//! template label on the cached mirror. What the pool owns is the claim
//! lock serializing claims within the template, and the reservation set
//! bridging the window between "chosen" and "patch confirmed". A sandbox
//! leaves the available view the instant it is reserved, before any patch
//! round-trip completes.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use kruise_cluster::{Cache, Sandbox};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::ManagerError;

pub const DEFAULT_CLAIM_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

/// Template-level flags, parsed from pool sandbox annotations.
#[derive(Debug, Clone)]
pub struct PoolFlags {
    pub init_runtime: bool,
    pub workers: usize,
    pub create_qps: u32,
}

impl Default for PoolFlags {
    fn default() -> Self {
        Self {
            init_runtime: true,
            workers: 0,
            create_qps: 0,
        }
    }
}

impl PoolFlags {
    pub fn from_annotations(annotations: &std::collections::BTreeMap<String, String>) -> Self {
        let defaults = Self::default();
        Self {
            init_runtime: annotations
                .get(kruise_cluster::object::ANNOTATION_POOL_INIT_RUNTIME)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.init_runtime),
            workers: annotations
                .get(kruise_cluster::object::ANNOTATION_POOL_WORKERS)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.workers),
            create_qps: annotations
                .get(kruise_cluster::object::ANNOTATION_POOL_CREATE_QPS)
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.create_qps),
        }
    }
}

pub struct Pool {
    template: String,
    flags: PoolFlags,
    /// Serializes claims within this pool. Claims against different pools
    /// proceed in parallel.
    claim_lock: tokio::sync::Mutex<()>,
    /// Sandbox ID -> reservation deadline.
    reserved: Mutex<HashMap<String, Instant>>,
    reservation_ttl: Duration,
}

impl Pool {
    fn new(template: &str, flags: PoolFlags, reservation_ttl: Duration) -> Self {
        Self {
            template: template.to_string(),
            flags,
            claim_lock: tokio::sync::Mutex::new(()),
            reserved: Mutex::new(HashMap::new()),
            reservation_ttl,
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    pub fn flags(&self) -> &PoolFlags {
        &self.flags
    }

    pub async fn lock_claims(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.claim_lock.lock().await
    }

    /// All live pool members.
    pub fn all(&self, cache: &Cache) -> Vec<Sandbox> {
        cache.sandboxes_by_template(&self.template)
    }

    /// Ready, unowned and unreserved members, in stable key order.
    pub fn available(&self, cache: &Cache) -> Vec<Sandbox> {
        let mut members: Vec<Sandbox> = cache
            .sandboxes_by_template(&self.template)
            .into_iter()
            .filter(|s| s.is_available() && !self.is_reserved(&s.id()))
            .collect();
        members.sort_by(|a, b| a.meta.name.cmp(&b.meta.name));
        members
    }

    pub fn is_reserved(&self, sandbox_id: &str) -> bool {
        let mut reserved = self.reserved.lock();
        match reserved.get(sandbox_id) {
            Some(deadline) if *deadline > Instant::now() => true,
            Some(_) => {
                reserved.remove(sandbox_id);
                false
            }
            None => false,
        }
    }

    /// Marks a sandbox as chosen by an in-flight claim. The entry expires
    /// on its own so crashed claimers cannot sterilize the pool.
    pub fn reserve(&self, sandbox_id: &str) {
        self.reserved
            .lock()
            .insert(sandbox_id.to_string(), Instant::now() + self.reservation_ttl);
        debug!(template = %self.template, sandbox_id, "sandbox reserved");
    }

    pub fn release(&self, sandbox_id: &str) {
        self.reserved.lock().remove(sandbox_id);
    }

    /// Drops reservations past their deadline; the janitor calls this.
    pub fn expire_stale(&self) -> usize {
        let now = Instant::now();
        let mut reserved = self.reserved.lock();
        let before = reserved.len();
        reserved.retain(|_, deadline| *deadline > now);
        before - reserved.len()
    }
}

/// Registry of pools, lazily materialized from templates the cache has
/// observed.
pub struct PoolSet {
    cache: Arc<Cache>,
    pools: DashMap<String, Arc<Pool>>,
    reservation_ttl: Duration,
}

impl PoolSet {
    pub fn new(cache: Arc<Cache>, reservation_ttl: Duration) -> Self {
        Self {
            cache,
            pools: DashMap::new(),
            reservation_ttl,
        }
    }

    /// Resolves the pool for a template; absent templates are an error the
    /// caller maps to `NotFound`.
    pub fn resolve(&self, template: &str) -> Result<Arc<Pool>, ManagerError> {
        if let Some(pool) = self.pools.get(template) {
            return Ok(Arc::clone(pool.value()));
        }
        let members = self.cache.sandboxes_by_template(template);
        if members.is_empty() {
            return Err(ManagerError::NotFound(format!("template {template}")));
        }
        let flags = PoolFlags::from_annotations(&members[0].meta.annotations);
        let pool = Arc::new(Pool::new(template, flags, self.reservation_ttl));
        let entry = self
            .pools
            .entry(template.to_string())
            .or_insert_with(|| Arc::clone(&pool));
        Ok(Arc::clone(entry.value()))
    }

    pub fn expire_stale_reservations(&self) {
        for entry in self.pools.iter() {
            let expired = entry.value().expire_stale();
            if expired > 0 {
                debug!(template = %entry.key(), expired, "expired stale reservations");
            }
        }
    }
}
