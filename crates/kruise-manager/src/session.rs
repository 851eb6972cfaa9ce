//! Protocol-session to sandbox binding.
//!
//! The first tool call in an MCP session claims a sandbox; every later
//! call reuses it. Sessions never migrate between users: a session id
//! presented with a different user id is an authentication failure, not a
//! silent reuse. Session records are replicated to peers with the same
//! fan-out discipline as routes, and informer callbacks keep the local map
//! coherent when cluster events remove the underlying sandbox.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use kruise_cluster::object::{ANNOTATION_ACCESS_TOKEN, ANNOTATION_SESSION_ID};
use kruise_cluster::{Cache, ClusterObject, EventHandler, Sandbox};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::agent::AgentClient;
use crate::claim::{ClaimEngine, ClaimOptions};
use crate::error::ManagerError;
use crate::handle::{SandboxHandle, TimeoutOptions};
use crate::peers::{Replicator, SyncChannel, SyncEnvelope};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Active,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSession {
    pub session_id: String,
    pub user_id: String,
    pub sandbox_id: String,
    pub access_token: String,
    pub state: SessionState,
}

pub struct SessionManager {
    cache: Arc<Cache>,
    engine: Arc<ClaimEngine>,
    replicator: Arc<Replicator>,
    agent: AgentClient,
    max_timeout: Duration,
    sessions: DashMap<String, UserSession>,
    by_sandbox: DashMap<String, String>,
    /// Serializes first-call creation so one session id never claims twice.
    create_lock: tokio::sync::Mutex<()>,
}

impl SessionManager {
    pub fn new(
        cache: Arc<Cache>,
        engine: Arc<ClaimEngine>,
        replicator: Arc<Replicator>,
        agent: AgentClient,
        max_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            engine,
            replicator,
            agent,
            max_timeout,
            sessions: DashMap::new(),
            by_sandbox: DashMap::new(),
            create_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn get(&self, session_id: &str) -> Option<UserSession> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    /// Returns the session's binding, claiming a fresh sandbox on first
    /// use. Cross-user access to an existing session is rejected.
    #[instrument(skip(self))]
    pub async fn get_or_create(
        &self,
        session_id: &str,
        user_id: &str,
        template: &str,
        ttl: Duration,
    ) -> Result<UserSession, ManagerError> {
        if let Some(existing) = self.get(session_id) {
            return self.authorize(existing, user_id);
        }

        let _guard = self.create_lock.lock().await;
        if let Some(existing) = self.get(session_id) {
            return self.authorize(existing, user_id);
        }

        let access_token = Uuid::new_v4().to_string();
        let mut options = ClaimOptions::new(user_id, template);
        let token = access_token.clone();
        let session_annotation = session_id.to_string();
        let shutdown = chrono::Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::max_value());
        options.modifier = Box::new(move |sandbox: &mut Sandbox| {
            sandbox
                .meta
                .annotations
                .insert(ANNOTATION_ACCESS_TOKEN.to_string(), token.clone());
            sandbox
                .meta
                .annotations
                .insert(ANNOTATION_SESSION_ID.to_string(), session_annotation.clone());
            sandbox.spec.shutdown_time = Some(shutdown);
        });

        let sandbox = self.engine.claim(options).await?;
        let session = UserSession {
            session_id: session_id.to_string(),
            user_id: user_id.to_string(),
            sandbox_id: sandbox.id(),
            access_token,
            state: SessionState::Active,
        };
        self.sessions.insert(session_id.to_string(), session.clone());
        self.by_sandbox.insert(sandbox.id(), session_id.to_string());
        info!(session_id, sandbox_id = %sandbox.id(), "session bound to sandbox");

        self.replicate(&session, false).await;
        Ok(session)
    }

    fn authorize(&self, session: UserSession, user_id: &str) -> Result<UserSession, ManagerError> {
        if session.user_id != user_id {
            return Err(ManagerError::AuthFailed(format!(
                "session {} belongs to another user",
                session.session_id
            )));
        }
        Ok(session)
    }

    /// Pushes the session's idle deadline out after a tool call.
    pub async fn refresh_ttl(&self, session_id: &str, ttl: Duration) -> Result<(), ManagerError> {
        let session = self
            .get(session_id)
            .ok_or_else(|| ManagerError::NotFound(format!("session {session_id}")))?;
        self.handle(&session.sandbox_id)
            .save_timeout(TimeoutOptions {
                timeout: ttl,
                auto_pause: false,
            })
            .await
    }

    pub fn handle(&self, sandbox_id: &str) -> SandboxHandle {
        SandboxHandle::new(
            sandbox_id,
            Arc::clone(&self.cache),
            self.agent.clone(),
            self.max_timeout,
        )
    }

    /// Drops the binding and replicates the deletion. The sandbox itself is
    /// reclaimed by its own shutdown clock unless the caller kills it.
    pub async fn remove(&self, session_id: &str) {
        if let Some((_, session)) = self.sessions.remove(session_id) {
            self.by_sandbox.remove(&session.sandbox_id);
            self.replicate(&session, true).await;
        }
    }

    /// Applies a record received from a peer.
    pub fn apply_sync(&self, envelope: SyncEnvelope<UserSession>) {
        if envelope.deleted {
            if let Some((_, session)) = self.sessions.remove(&envelope.record.session_id) {
                self.by_sandbox.remove(&session.sandbox_id);
            }
            return;
        }
        self.by_sandbox.insert(
            envelope.record.sandbox_id.clone(),
            envelope.record.session_id.clone(),
        );
        self.sessions
            .insert(envelope.record.session_id.clone(), envelope.record);
    }

    /// Sessions carry no owner replica; a binding stays valid as long as
    /// its sandbox lives, so only cluster deletes invalidate it.
    fn drop_for_sandbox(&self, sandbox_id: &str) -> Option<UserSession> {
        let (_, session_id) = self.by_sandbox.remove(sandbox_id)?;
        self.sessions.remove(&session_id).map(|(_, session)| session)
    }

    fn mark_closed(&self, sandbox_id: &str) {
        if let Some(session_id) = self.by_sandbox.get(sandbox_id).map(|e| e.value().clone()) {
            if let Some(mut session) = self.sessions.get_mut(&session_id) {
                session.state = SessionState::Closed;
            }
        }
    }

    async fn replicate(&self, session: &UserSession, deleted: bool) {
        // Best-effort: a peer that misses this update serves NotFound and
        // the client retries after the next sync.
        if let Err(error) = self
            .replicator
            .replicate(SyncChannel::Session, session, deleted)
            .await
        {
            warn!(session_id = %session.session_id, %error, "session replication incomplete");
        }
    }
}

/// Sandbox watch subscriber keeping the session map coherent when cluster
/// events change sandboxes without an API call through this replica.
pub struct SessionSandboxHandler(pub Arc<SessionManager>);

impl EventHandler for SessionSandboxHandler {
    fn on_add(&self, _object: &ClusterObject) {}

    fn on_update(&self, _old: &ClusterObject, new: &ClusterObject) {
        if let ClusterObject::Sandbox(sandbox) = new {
            if sandbox.meta.deletion_timestamp.is_some() {
                self.0.mark_closed(&sandbox.id());
            }
        }
    }

    fn on_delete(&self, object: &ClusterObject) {
        if let ClusterObject::Sandbox(sandbox) = object {
            if let Some(session) = self.0.drop_for_sandbox(&sandbox.id()) {
                info!(session_id = %session.session_id, sandbox_id = %sandbox.id(), "session dropped with its sandbox");
                let manager = Arc::clone(&self.0);
                // Handlers must not block; replicate from a task.
                tokio::spawn(async move {
                    manager.replicate(&session, true).await;
                });
            }
        }
    }
}
