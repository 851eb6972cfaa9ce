//! Core sandbox manager for the orchestrator.
//!
//! Turns declarative cluster state (a stream of sandbox objects with
//! spec/status) plus concurrent client requests into consistent per-user
//! sandbox lifecycles: pools and atomic claims, a façade over single
//! sandbox operations, request routing with peer forwarding, replica
//! membership with route/session replication, MCP session binding and the
//! secret-backed API-key registry.

pub mod agent;
pub mod claim;
pub mod csi;
pub mod error;
pub mod handle;
pub mod keys;
pub mod peers;
pub mod pool;
pub mod router;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use kruise_cluster::{Cache, ClusterBackend, ClusterObject, EventHandler, Kind, Sandbox};
use parking_lot::Mutex;
use tracing::{info, warn};

pub use agent::{AgentClient, CommandOutcome, Execution, ExecutionLogs};
pub use claim::{
    ClaimEngine, ClaimEngineConfig, ClaimOptions, CsiMountOptions, InitRuntimeOptions,
    InplaceUpdateOptions,
};
pub use csi::CsiMounter;
pub use error::ManagerError;
pub use handle::{eviction_time, SandboxHandle, TimeoutOptions};
pub use keys::{ApiKeyRecord, KeyStore};
pub use peers::{Membership, Peer, Replicator, SyncChannel, SyncEnvelope};
pub use pool::{PoolSet, DEFAULT_CLAIM_LOCK_TIMEOUT};
pub use router::{RouteDecision, RouteRecord, RouteTable, Router, UpstreamHost};
pub use session::{SessionManager, SessionState, UserSession};

pub const DEFAULT_MAX_TIMEOUT: Duration = Duration::from_secs(2_592_000);

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Namespace holding the orchestrator's own objects (key secret, pods).
    pub system_namespace: String,
    /// This replica's reachable address, as peers see it.
    pub self_ip: String,
    /// Label selector matching the orchestrator's own pods.
    pub peer_selector: String,
    /// Port peers use for route hello/sync and forwarded proxy entry.
    pub gateway_port: u16,
    /// Port peers use for session hello/sync.
    pub session_sync_port: u16,
    pub max_timeout: Duration,
    pub max_claim_workers: usize,
    pub max_create_qps: u32,
    pub heartbeat_interval: Duration,
    pub agent_request_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            system_namespace: "kruise-system".to_string(),
            self_ip: "127.0.0.1".to_string(),
            peer_selector: "app=kruise-gateway".to_string(),
            gateway_port: 8080,
            session_sync_port: 8081,
            max_timeout: DEFAULT_MAX_TIMEOUT,
            max_claim_workers: claim::DEFAULT_MAX_CLAIM_WORKERS,
            max_create_qps: claim::DEFAULT_MAX_CREATE_QPS,
            heartbeat_interval: peers::DEFAULT_HEARTBEAT_INTERVAL,
            agent_request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct SandboxManager {
    config: ManagerConfig,
    cache: Arc<Cache>,
    pools: Arc<PoolSet>,
    engine: Arc<ClaimEngine>,
    routes: Arc<RouteTable>,
    router: Arc<Router>,
    membership: Arc<Membership>,
    replicator: Arc<Replicator>,
    sessions: Arc<SessionManager>,
    keys: Arc<KeyStore>,
    agent: AgentClient,
    background: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SandboxManager {
    /// Wires the full manager against a backend. Event handlers are
    /// registered here, before the watch stream starts in [`Self::start`],
    /// so no event is missed.
    pub fn new(
        backend: Arc<dyn ClusterBackend>,
        config: ManagerConfig,
    ) -> Result<Arc<Self>, ManagerError> {
        let cache = Cache::new(backend.clone());
        let agent = AgentClient::new(config.agent_request_timeout)?;

        let pools = Arc::new(PoolSet::new(Arc::clone(&cache), DEFAULT_CLAIM_LOCK_TIMEOUT));
        let csi = Arc::new(CsiMounter::new(Arc::clone(&cache)));
        let engine = Arc::new(ClaimEngine::new(
            Arc::clone(&cache),
            Arc::clone(&pools),
            agent.clone(),
            csi,
            ClaimEngineConfig {
                max_workers: config.max_claim_workers,
                patch_qps: config.max_create_qps,
                ..ClaimEngineConfig::default()
            },
        ));

        let membership = Arc::new(Membership::new(
            &config.self_ip,
            &config.peer_selector,
            config.gateway_port,
            config.session_sync_port,
            config.heartbeat_interval,
        )?);
        let replicator = Arc::new(Replicator::new(Arc::clone(&membership))?);

        let routes = Arc::new(RouteTable::new());
        let keys = Arc::new(KeyStore::new(backend, &config.system_namespace));
        let router = Arc::new(Router::new(
            Arc::clone(&routes),
            Arc::clone(&keys),
            &config.self_ip,
            config.gateway_port,
        ));

        let sessions = SessionManager::new(
            Arc::clone(&cache),
            Arc::clone(&engine),
            Arc::clone(&replicator),
            agent.clone(),
            config.max_timeout,
        );

        // Evicted peers take their replicated routes with them.
        {
            let routes = Arc::clone(&routes);
            membership.on_evict(move |peer_ip| {
                let purged = routes.purge_replica(peer_ip);
                if !purged.is_empty() {
                    info!(peer = %peer_ip, purged = purged.len(), "purged routes of evicted peer");
                }
            });
        }

        let manager = Arc::new(Self {
            config,
            cache: Arc::clone(&cache),
            pools,
            engine,
            routes,
            router,
            membership: Arc::clone(&membership),
            replicator,
            sessions: Arc::clone(&sessions),
            keys,
            agent,
            background: Mutex::new(Vec::new()),
        });

        cache.subscribe(Kind::Pod, Arc::new(peers::PodMembershipHandler(membership)))?;
        cache.subscribe(
            Kind::Sandbox,
            Arc::new(session::SessionSandboxHandler(sessions)),
        )?;
        cache.subscribe(Kind::Sandbox, Arc::new(RouteGcHandler(Arc::clone(&manager))))?;

        Ok(manager)
    }

    /// Starts the watch stream and the background loops. `admin_key` seeds
    /// the key store when the secret does not exist yet.
    pub async fn start(self: &Arc<Self>, admin_key: Option<String>) -> Result<(), ManagerError> {
        self.cache.start().await?;
        if let Some(created) = self.keys.bootstrap(admin_key).await? {
            // Printed exactly once, on first bootstrap.
            info!(admin_key = %created, "generated admin api key");
        }

        let mut background = self.background.lock();
        background.push(self.membership.spawn_heartbeat_loop());
        background.push(self.keys.spawn_refresh_loop(keys::DEFAULT_REFRESH_INTERVAL));
        background.push(self.spawn_reservation_janitor());
        Ok(())
    }

    fn spawn_reservation_janitor(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let pools = Arc::clone(&self.pools);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                pools.expire_stale_reservations();
            }
        })
    }

    /// Stops the background loops. In-flight requests drain through the
    /// HTTP server's own shutdown.
    pub fn shutdown(&self) {
        for task in self.background.lock().drain(..) {
            task.abort();
        }
    }

    /// Claims a sandbox and publishes its route to every replica.
    pub async fn claim_sandbox(&self, options: ClaimOptions) -> Result<Sandbox, ManagerError> {
        let sandbox = self.engine.claim(options).await?;
        self.publish_route(&sandbox).await;
        Ok(sandbox)
    }

    pub async fn publish_route(&self, sandbox: &Sandbox) {
        let record = RouteRecord {
            sandbox_id: sandbox.id(),
            ip: sandbox.status.ip.clone(),
            owner: sandbox.owner().to_string(),
            extra_headers: Default::default(),
            owner_replica: self.config.self_ip.clone(),
        };
        self.routes.insert(record.clone());
        if let Err(error) = self
            .replicator
            .replicate(SyncChannel::Route, &record, false)
            .await
        {
            warn!(sandbox_id = %record.sandbox_id, %error, "route replication incomplete");
        }
    }

    pub async fn retract_route(&self, sandbox_id: &str) {
        if let Some(record) = self.routes.remove(sandbox_id) {
            if let Err(error) = self
                .replicator
                .replicate(SyncChannel::Route, &record, true)
                .await
            {
                warn!(sandbox_id, %error, "route retraction incomplete");
            }
        }
    }

    /// Applies a route record received from a peer.
    pub fn apply_route_sync(&self, envelope: SyncEnvelope<RouteRecord>) {
        if envelope.deleted {
            self.routes.remove(&envelope.record.sandbox_id);
        } else {
            self.routes.insert(envelope.record);
        }
    }

    pub fn handle(&self, sandbox_id: &str) -> SandboxHandle {
        SandboxHandle::new(
            sandbox_id,
            Arc::clone(&self.cache),
            self.agent.clone(),
            self.config.max_timeout,
        )
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn keys(&self) -> &Arc<KeyStore> {
        &self.keys
    }

    pub fn agent(&self) -> &AgentClient {
        &self.agent
    }
}

/// Removes routes when their sandbox leaves the cluster. Only the owning
/// replica retracts; peers drop their copy through the replicated delete.
struct RouteGcHandler(Arc<SandboxManager>);

impl EventHandler for RouteGcHandler {
    fn on_add(&self, _object: &ClusterObject) {}

    fn on_update(&self, _old: &ClusterObject, _new: &ClusterObject) {}

    fn on_delete(&self, object: &ClusterObject) {
        if let ClusterObject::Sandbox(sandbox) = object {
            let id = sandbox.id();
            let manager = Arc::clone(&self.0);
            let owned_here = manager
                .routes
                .get(&id)
                .map(|record| record.owner_replica == manager.config.self_ip)
                .unwrap_or(false);
            if owned_here {
                tokio::spawn(async move {
                    manager.retract_route(&id).await;
                });
            } else {
                manager.routes.remove(&id);
            }
        }
    }
}
