//! Maps inbound proxy requests to sandbox upstreams.
//!
//! Two adapters extract `(sandbox_id, port)` from a request: the
//! authority form `"<port>-<sandbox>.domain"` and the path form
//! `"/kruise/<sandbox>/<port>/<rest>"`. The route table is a replicated
//! cache; the authoritative copy of each route lives on the replica that
//! claimed the sandbox, everything else is a forwarding hint.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ManagerError;
use crate::keys::KeyStore;

/// Ports the downstream tooling cannot attach credentials to (CDP, VNC).
pub const NO_AUTH_PORTS: [u16; 2] = [9222, 5900];
pub const NO_AUTH_USER: &str = "no-auth-needed";
pub const ANONYMOUS_USER: &str = "anonymous";

pub const HEADER_ACCESS_TOKEN: &str = "X-Access-Token";

pub const PATH_PREFIX: &str = "/kruise/";
pub const API_PATH_PREFIX: &str = "/kruise/api";

fn authority_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^(\d+)-([A-Za-z0-9-]+)\.").expect("valid authority pattern"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedTarget {
    pub sandbox_id: String,
    pub port: u16,
    /// Set by the path adapter; the request must be forwarded with this
    /// path instead of the original.
    pub rewritten_path: Option<String>,
}

/// Authority adapter. `Ok(None)` means the request targets the main API.
pub fn parse_authority(authority: &str) -> Result<Option<ParsedTarget>, ManagerError> {
    if authority.starts_with("api.") {
        return Ok(None);
    }
    let captures = authority_pattern().captures(authority).ok_or_else(|| {
        ManagerError::BadRequest(format!("authority {authority} is not a sandbox address"))
    })?;
    let port: u16 = captures[1]
        .parse()
        .map_err(|_| ManagerError::BadRequest(format!("invalid port in authority {authority}")))?;
    Ok(Some(ParsedTarget {
        sandbox_id: captures[2].to_string(),
        port,
        rewritten_path: None,
    }))
}

/// Path adapter for environments without subdomain routing.
/// `/kruise/<sandbox>/<port>/<rest>` forwards `/<rest>` to the sandbox;
/// `/kruise/api/...` is the main API.
pub fn parse_path(path: &str) -> Result<Option<ParsedTarget>, ManagerError> {
    if path.starts_with(API_PATH_PREFIX) {
        return Ok(None);
    }
    let stripped = path
        .strip_prefix(PATH_PREFIX)
        .ok_or_else(|| ManagerError::BadRequest(format!("path {path} is not a sandbox path")))?;

    let mut parts = stripped.splitn(3, '/');
    let sandbox_id = parts
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| ManagerError::BadRequest(format!("path {path} misses a sandbox id")))?;
    let port: u16 = parts
        .next()
        .and_then(|p| p.parse().ok())
        .ok_or_else(|| ManagerError::BadRequest(format!("path {path} misses a sandbox port")))?;
    let rest = parts.next().unwrap_or("");

    Ok(Some(ParsedTarget {
        sandbox_id: sandbox_id.to_string(),
        port,
        rewritten_path: Some(format!("/{rest}")),
    }))
}

/// One routable sandbox. Replicated to peers with `owner_replica` naming
/// the replica holding the authoritative copy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteRecord {
    pub sandbox_id: String,
    pub ip: String,
    pub owner: String,
    #[serde(default)]
    pub extra_headers: HashMap<String, String>,
    pub owner_replica: String,
}

#[derive(Default)]
pub struct RouteTable {
    routes: DashMap<String, RouteRecord>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: RouteRecord) {
        debug!(sandbox_id = %record.sandbox_id, owner_replica = %record.owner_replica, "route upserted");
        self.routes.insert(record.sandbox_id.clone(), record);
    }

    pub fn remove(&self, sandbox_id: &str) -> Option<RouteRecord> {
        self.routes.remove(sandbox_id).map(|(_, record)| record)
    }

    pub fn get(&self, sandbox_id: &str) -> Option<RouteRecord> {
        self.routes.get(sandbox_id).map(|entry| entry.value().clone())
    }

    /// Drops every route owned by an evicted replica. Returns the purged
    /// sandbox ids.
    pub fn purge_replica(&self, replica: &str) -> Vec<String> {
        let stale: Vec<String> = self
            .routes
            .iter()
            .filter(|entry| entry.value().owner_replica == replica)
            .map(|entry| entry.key().clone())
            .collect();
        for id in &stale {
            self.routes.remove(id);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamHost {
    /// This replica owns the route; stream straight to the sandbox.
    Local { sandbox_ip: String },
    /// A peer owns it; forward the request to that replica's listener.
    Peer { host: String },
}

#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub sandbox_id: String,
    pub port: u16,
    pub path: String,
    pub user: String,
    pub extra_headers: HashMap<String, String>,
    pub upstream: UpstreamHost,
}

pub struct Router {
    table: Arc<RouteTable>,
    keys: Arc<KeyStore>,
    self_replica: String,
    peer_entry_port: u16,
}

impl Router {
    pub fn new(
        table: Arc<RouteTable>,
        keys: Arc<KeyStore>,
        self_replica: &str,
        peer_entry_port: u16,
    ) -> Self {
        Self {
            table,
            keys,
            self_replica: self_replica.to_string(),
            peer_entry_port,
        }
    }

    pub fn table(&self) -> &Arc<RouteTable> {
        &self.table
    }

    /// Routes one request. `Ok(None)` is a passthrough to the main API;
    /// a missing route is `NotFound` (it may simply not have replicated
    /// yet, clients retry).
    pub fn decide(
        &self,
        authority: &str,
        path: &str,
        access_token: Option<&str>,
    ) -> Result<Option<RouteDecision>, ManagerError> {
        let parsed = if path.starts_with(PATH_PREFIX) {
            parse_path(path)?
        } else {
            parse_authority(authority)?
        };
        let Some(target) = parsed else {
            return Ok(None);
        };

        let route = self.table.get(&target.sandbox_id).ok_or_else(|| {
            ManagerError::NotFound(format!("route for sandbox {}", target.sandbox_id))
        })?;

        let user = if NO_AUTH_PORTS.contains(&target.port) {
            NO_AUTH_USER.to_string()
        } else {
            access_token
                .and_then(|token| self.keys.load_by_key(token))
                .map(|record| record.created_by)
                .unwrap_or_else(|| ANONYMOUS_USER.to_string())
        };

        let upstream = if route.owner_replica == self.self_replica {
            UpstreamHost::Local {
                sandbox_ip: route.ip.clone(),
            }
        } else {
            UpstreamHost::Peer {
                host: format!("{}:{}", route.owner_replica, self.peer_entry_port),
            }
        };

        Ok(Some(RouteDecision {
            sandbox_id: target.sandbox_id,
            port: target.port,
            path: target.rewritten_path.unwrap_or_else(|| path.to_string()),
            user,
            extra_headers: route.extra_headers,
            upstream,
        }))
    }
}
