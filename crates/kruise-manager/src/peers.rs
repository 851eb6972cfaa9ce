//! Peer membership and record replication between orchestrator replicas.
//!
//! Replicas discover each other through a label selector over their own
//! pods, fed by the same watch machinery as everything else. A heartbeat
//! ticker pings every known peer; peers that stay silent for five
//! intervals are evicted, and eviction listeners purge whatever state that
//! peer owned (replicated routes, sessions).
//!
//! Replication is best-effort fan-out: a replica that misses an update
//! serves `NotFound` until the next sync and the client retries.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use kruise_cluster::{ClusterObject, EventHandler, Pod};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ManagerError;

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const EVICTION_INTERVALS: u32 = 5;

pub const ROUTE_HELLO_PATH: &str = "/peer/hello";
pub const ROUTE_SYNC_PATH: &str = "/route/sync";
pub const SESSION_HELLO_PATH: &str = "/session/hello";
pub const SESSION_SYNC_PATH: &str = "/session/sync";

#[derive(Debug, Clone)]
pub struct Peer {
    pub ip: String,
    pub last_heartbeat: DateTime<Utc>,
}

/// Upsert-or-delete envelope shared by both sync endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEnvelope<T> {
    pub record: T,
    #[serde(default)]
    pub deleted: bool,
}

pub struct Membership {
    self_ip: String,
    selector: BTreeMap<String, String>,
    peers: DashMap<String, Peer>,
    evict_listeners: RwLock<Vec<Box<dyn Fn(&str) + Send + Sync>>>,
    client: reqwest::Client,
    route_port: u16,
    session_port: u16,
    heartbeat_interval: Duration,
}

impl Membership {
    pub fn new(
        self_ip: &str,
        selector: &str,
        route_port: u16,
        session_port: u16,
        heartbeat_interval: Duration,
    ) -> Result<Self, ManagerError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| ManagerError::Internal(err.into()))?;
        Ok(Self {
            self_ip: self_ip.to_string(),
            selector: parse_selector(selector)?,
            peers: DashMap::new(),
            evict_listeners: RwLock::new(Vec::new()),
            client,
            route_port,
            session_port,
            heartbeat_interval,
        })
    }

    pub fn self_ip(&self) -> &str {
        &self.self_ip
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.peers.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Registers a purge callback fired with the evicted peer's IP.
    pub fn on_evict(&self, listener: impl Fn(&str) + Send + Sync + 'static) {
        self.evict_listeners.write().push(Box::new(listener));
    }

    fn matches_selector(&self, pod: &Pod) -> bool {
        self.selector
            .iter()
            .all(|(key, value)| pod.meta.labels.get(key) == Some(value))
    }

    /// Feeds pod watch events into the peer set.
    pub fn observe_pod(&self, pod: &Pod, deleted: bool) {
        if !self.matches_selector(pod) || pod.ip.is_empty() || pod.ip == self.self_ip {
            return;
        }
        if deleted {
            if self.peers.remove(&pod.ip).is_some() {
                info!(peer = %pod.ip, "peer pod deleted");
                self.fire_evict(&pod.ip);
            }
            return;
        }
        self.peers
            .entry(pod.ip.clone())
            .and_modify(|peer| peer.last_heartbeat = Utc::now())
            .or_insert_with(|| {
                info!(peer = %pod.ip, "peer discovered");
                Peer {
                    ip: pod.ip.clone(),
                    last_heartbeat: Utc::now(),
                }
            });
    }

    /// Incoming hello from a sibling: learn or refresh the caller.
    pub fn register_hello(&self, caller_ip: &str) {
        if caller_ip.is_empty() || caller_ip == self.self_ip {
            return;
        }
        self.peers
            .entry(caller_ip.to_string())
            .and_modify(|peer| peer.last_heartbeat = Utc::now())
            .or_insert_with(|| {
                info!(peer = %caller_ip, "peer learned from hello");
                Peer {
                    ip: caller_ip.to_string(),
                    last_heartbeat: Utc::now(),
                }
            });
    }

    /// Pings every peer on both channels, then evicts the silent ones.
    pub async fn heartbeat_once(&self) {
        let peers: Vec<String> = self.peers.iter().map(|e| e.key().clone()).collect();
        let pings = peers.iter().map(|ip| {
            let route_url = format!(
                "http://{ip}:{}{}?from={}",
                self.route_port, ROUTE_HELLO_PATH, self.self_ip
            );
            let session_url = format!(
                "http://{ip}:{}{}?from={}",
                self.session_port, SESSION_HELLO_PATH, self.self_ip
            );
            let client = self.client.clone();
            async move {
                let route_ok = client.get(&route_url).send().await.map(|r| r.status().is_success());
                let session_ok = client
                    .get(&session_url)
                    .send()
                    .await
                    .map(|r| r.status().is_success());
                (
                    ip.clone(),
                    matches!(route_ok, Ok(true)) || matches!(session_ok, Ok(true)),
                )
            }
        });

        for (ip, alive) in join_all(pings).await {
            if alive {
                if let Some(mut peer) = self.peers.get_mut(&ip) {
                    peer.last_heartbeat = Utc::now();
                }
            }
        }
        self.evict_stale();
    }

    fn evict_stale(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.heartbeat_interval * EVICTION_INTERVALS)
                .unwrap_or_else(|_| chrono::Duration::seconds(25));
        let stale: Vec<String> = self
            .peers
            .iter()
            .filter(|entry| entry.value().last_heartbeat < cutoff)
            .map(|entry| entry.key().clone())
            .collect();
        for ip in stale {
            self.peers.remove(&ip);
            warn!(peer = %ip, "peer evicted after missed heartbeats");
            self.fire_evict(&ip);
        }
    }

    fn fire_evict(&self, ip: &str) {
        for listener in self.evict_listeners.read().iter() {
            listener(ip);
        }
    }

    pub fn spawn_heartbeat_loop(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let membership = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(membership.heartbeat_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                membership.heartbeat_once().await;
            }
        })
    }

    fn sync_port(&self, channel: SyncChannel) -> u16 {
        match channel {
            SyncChannel::Route => self.route_port,
            SyncChannel::Session => self.session_port,
        }
    }
}

/// Bridges pod watch events into membership.
pub struct PodMembershipHandler(pub Arc<Membership>);

impl EventHandler for PodMembershipHandler {
    fn on_add(&self, object: &ClusterObject) {
        if let ClusterObject::Pod(pod) = object {
            self.0.observe_pod(pod, false);
        }
    }

    fn on_update(&self, _old: &ClusterObject, new: &ClusterObject) {
        if let ClusterObject::Pod(pod) = new {
            self.0.observe_pod(pod, pod.meta.deletion_timestamp.is_some());
        }
    }

    fn on_delete(&self, object: &ClusterObject) {
        if let ClusterObject::Pod(pod) = object {
            self.0.observe_pod(pod, true);
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum SyncChannel {
    Route,
    Session,
}

impl SyncChannel {
    fn path(self) -> &'static str {
        match self {
            SyncChannel::Route => ROUTE_SYNC_PATH,
            SyncChannel::Session => SESSION_SYNC_PATH,
        }
    }
}

/// Fans record changes out to every current peer in parallel. Failures are
/// aggregated and logged; replication is a hint, not a transaction.
pub struct Replicator {
    membership: Arc<Membership>,
    client: reqwest::Client,
}

impl Replicator {
    pub fn new(membership: Arc<Membership>) -> Result<Self, ManagerError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(2))
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(|err| ManagerError::Internal(err.into()))?;
        Ok(Self { membership, client })
    }

    pub async fn replicate<T>(
        &self,
        channel: SyncChannel,
        record: &T,
        deleted: bool,
    ) -> Result<(), ManagerError>
    where
        T: Serialize + DeserializeOwned + Clone + Send + Sync,
    {
        let peers = self.membership.peers();
        if peers.is_empty() {
            return Ok(());
        }
        let port = self.membership.sync_port(channel);
        let envelope = SyncEnvelope {
            record: record.clone(),
            deleted,
        };

        let posts = peers.iter().map(|peer| {
            let url = format!("http://{}:{}{}", peer.ip, port, channel.path());
            let client = self.client.clone();
            let envelope = envelope.clone();
            let ip = peer.ip.clone();
            async move {
                let result = client.post(&url).json(&envelope).send().await;
                match result {
                    Ok(response) if response.status().is_success() => None,
                    Ok(response) => Some(format!("{ip}: status {}", response.status())),
                    Err(err) => Some(format!("{ip}: {err}")),
                }
            }
        });

        let failures: Vec<String> = join_all(posts).await.into_iter().flatten().collect();
        if failures.is_empty() {
            debug!(channel = ?channel, "record replicated to all peers");
            Ok(())
        } else {
            warn!(channel = ?channel, failures = %failures.join("; "), "partial replication");
            Err(ManagerError::Upstream(format!(
                "replication incomplete: {}",
                failures.join("; ")
            )))
        }
    }
}

fn parse_selector(selector: &str) -> Result<BTreeMap<String, String>, ManagerError> {
    let mut parsed = BTreeMap::new();
    for pair in selector.split(',').filter(|s| !s.trim().is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ManagerError::BadRequest(format!("invalid selector term {pair}")))?;
        parsed.insert(key.trim().to_string(), value.trim().to_string());
    }
    if parsed.is_empty() {
        return Err(ManagerError::BadRequest(
            "peer selector must not be empty".into(),
        ));
    }
    Ok(parsed)
}
