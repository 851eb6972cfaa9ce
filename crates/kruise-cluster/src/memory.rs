//! In-memory cluster backend.
//!
//! Serves two roles: the store behind every test, and the standalone
//! single-node mode of the gateway. A Kubernetes-backed implementation
//! plugs in behind the same [`ClusterBackend`] trait later; this one keeps
//! the full optimistic-concurrency and watch semantics so nothing above it
//! can tell the difference.
//!
//! When the fake reconciler is enabled, desired-state writes are reconciled
//! synchronously before the watch event is emitted (zero latency): claims
//! are accepted, pause/resume transitions land, inplace image updates flip
//! `Ready`, and deletion markers remove the object.

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::debug;

use crate::backend::{ClusterBackend, ClusterError};
use crate::object::{
    ClusterObject, ConditionKind, EventType, Kind, SandboxState, WatchEvent, ANNOTATION_OWNER,
};

const WATCH_CHANNEL_CAPACITY: usize = 1024;

pub struct MemoryBackend {
    objects: RwLock<HashMap<(Kind, String), ClusterObject>>,
    next_rv: RwLock<u64>,
    channels: HashMap<Kind, broadcast::Sender<WatchEvent>>,
    reconcile: bool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// Backend with the built-in zero-latency reconciler, for tests and
    /// standalone mode.
    pub fn reconciling() -> Self {
        Self::build(true)
    }

    fn build(reconcile: bool) -> Self {
        let mut channels = HashMap::new();
        for kind in Kind::ALL {
            let (tx, _) = broadcast::channel(WATCH_CHANNEL_CAPACITY);
            channels.insert(kind, tx);
        }
        Self {
            objects: RwLock::new(HashMap::new()),
            next_rv: RwLock::new(0),
            channels,
            reconcile,
        }
    }

    fn bump_rv(&self) -> String {
        let mut rv = self.next_rv.write();
        *rv += 1;
        rv.to_string()
    }

    fn emit(&self, event_type: EventType, object: ClusterObject) {
        let kind = object.kind();
        // Send fails only when nobody watches, which is fine.
        let _ = self.channels[&kind].send(WatchEvent { event_type, object });
    }

    /// Desired-state reconciliation the external control plane would do.
    fn reconcile_sandbox(sandbox: &mut crate::object::Sandbox) {
        if sandbox.status.ip.is_empty() {
            sandbox.status.ip = synth_ip(&sandbox.meta.name);
        }
        if sandbox.status.image.is_empty() {
            sandbox.status.image = sandbox.spec.image.clone();
        }

        // Accept pending claims.
        if sandbox.meta.annotations.contains_key(ANNOTATION_OWNER)
            && !sandbox.condition(ConditionKind::ClaimAccepted)
        {
            sandbox.set_condition(ConditionKind::ClaimAccepted, true);
        }

        // Inplace image update: the new image "starts" immediately.
        if !sandbox.spec.image.is_empty() && sandbox.status.image != sandbox.spec.image {
            sandbox.status.image = sandbox.spec.image.clone();
        }

        if sandbox.spec.paused {
            sandbox.status.state = SandboxState::Paused;
            sandbox.set_condition(ConditionKind::Paused, true);
            sandbox.set_condition(ConditionKind::Ready, false);
        } else {
            sandbox.status.state = SandboxState::Running;
            sandbox.set_condition(ConditionKind::Paused, false);
            sandbox.set_condition(ConditionKind::Ready, true);
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ClusterBackend for MemoryBackend {
    async fn get(&self, kind: Kind, key: &str) -> Result<Option<ClusterObject>, ClusterError> {
        Ok(self.objects.read().get(&(kind, key.to_string())).cloned())
    }

    async fn list(&self, kind: Kind) -> Result<Vec<ClusterObject>, ClusterError> {
        Ok(self
            .objects
            .read()
            .iter()
            .filter(|((k, _), _)| *k == kind)
            .map(|(_, object)| object.clone())
            .collect())
    }

    async fn create(&self, mut object: ClusterObject) -> Result<String, ClusterError> {
        let kind = object.kind();
        let key = object.id();
        let rv = self.bump_rv();
        object.meta_mut().resource_version = rv.clone();
        if object.meta().created_at.is_none() {
            object.meta_mut().created_at = Some(Utc::now());
        }
        if self.reconcile {
            if let ClusterObject::Sandbox(sandbox) = &mut object {
                Self::reconcile_sandbox(sandbox);
            }
        }

        let mut objects = self.objects.write();
        if objects.contains_key(&(kind, key.clone())) {
            return Err(ClusterError::AlreadyExists(kind, key));
        }
        objects.insert((kind, key.clone()), object.clone());
        drop(objects);

        debug!(kind = %kind, key = %key, rv = %rv, "object created");
        self.emit(EventType::Added, object);
        Ok(rv)
    }

    async fn update(&self, mut object: ClusterObject) -> Result<String, ClusterError> {
        let kind = object.kind();
        let key = object.id();

        let mut objects = self.objects.write();
        let current = objects
            .get(&(kind, key.clone()))
            .ok_or_else(|| ClusterError::NotFound(kind, key.clone()))?;

        if current.meta().resource_version != object.meta().resource_version {
            return Err(ClusterError::Conflict(key));
        }

        let rv = self.bump_rv();
        object.meta_mut().resource_version = rv.clone();
        if self.reconcile {
            if let ClusterObject::Sandbox(sandbox) = &mut object {
                if sandbox.meta.deletion_timestamp.is_none() {
                    Self::reconcile_sandbox(sandbox);
                }
            }
        }

        // A reconciling store tears deleted objects down immediately.
        if self.reconcile && object.meta().deletion_timestamp.is_some() {
            objects.remove(&(kind, key.clone()));
            drop(objects);
            self.emit(EventType::Deleted, object);
            return Ok(rv);
        }

        objects.insert((kind, key.clone()), object.clone());
        drop(objects);

        self.emit(EventType::Modified, object);
        Ok(rv)
    }

    async fn mark_deleted(&self, kind: Kind, key: &str) -> Result<(), ClusterError> {
        let mut objects = self.objects.write();
        let Some(object) = objects.get_mut(&(kind, key.to_string())) else {
            return Ok(());
        };
        if object.meta().deletion_timestamp.is_some() {
            return Ok(());
        }
        object.meta_mut().deletion_timestamp = Some(Utc::now());
        let rv = {
            let mut next = self.next_rv.write();
            *next += 1;
            next.to_string()
        };
        object.meta_mut().resource_version = rv;

        if self.reconcile {
            let removed = objects.remove(&(kind, key.to_string())).unwrap();
            drop(objects);
            self.emit(EventType::Deleted, removed);
        } else {
            let updated = object.clone();
            drop(objects);
            self.emit(EventType::Modified, updated);
        }
        Ok(())
    }

    fn watch(&self, kind: Kind) -> broadcast::Receiver<WatchEvent> {
        self.channels[&kind].subscribe()
    }
}

/// Deterministic pod address for the fake reconciler, derived from the
/// name. Addresses live in loopback space so standalone mode and tests can
/// reach (or be refused by) them without real pods.
fn synth_ip(name: &str) -> String {
    let h: u32 = name.bytes().fold(2166136261u32, |acc, b| {
        (acc ^ b as u32).wrapping_mul(16777619)
    });
    format!("127.{}.{}.{}", (h >> 16) & 0xff, (h >> 8) & 0xff, (h & 0xff) | 1)
}
