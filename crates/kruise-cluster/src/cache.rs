//! Indexed local mirror of the cluster store with event fan-out.
//!
//! One dispatch task per kind consumes the backend watch stream, updates
//! the mirror and invokes registered handlers in arrival order. Handlers
//! are registered before [`Cache::start`] so no event is missed, and they
//! must return quickly; long work is scheduled elsewhere.
//!
//! Loss of the watch connection surfaces as a lagged receiver; the
//! dispatcher re-lists and replays the diff, so handlers may observe
//! redundant updates and must be idempotent.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::backend::{ClusterBackend, ClusterError};
use crate::expectations::Expectations;
use crate::object::{ClusterObject, EventType, Kind, Sandbox, WatchEvent};

pub trait EventHandler: Send + Sync + 'static {
    fn on_add(&self, object: &ClusterObject);
    fn on_update(&self, old: &ClusterObject, new: &ClusterObject);
    fn on_delete(&self, object: &ClusterObject);
}

pub struct Cache {
    backend: Arc<dyn ClusterBackend>,
    mirrors: DashMap<Kind, Arc<DashMap<String, ClusterObject>>>,
    /// Sandbox keys grouped by their template label.
    by_template: DashMap<String, HashSet<String>>,
    handlers: RwLock<Vec<(Kind, Arc<dyn EventHandler>)>>,
    expectations: Arc<Expectations>,
    changed: Notify,
    started: AtomicBool,
}

impl Cache {
    pub fn new(backend: Arc<dyn ClusterBackend>) -> Arc<Self> {
        let mirrors = DashMap::new();
        for kind in Kind::ALL {
            mirrors.insert(kind, Arc::new(DashMap::new()));
        }
        Arc::new(Self {
            backend,
            mirrors,
            by_template: DashMap::new(),
            handlers: RwLock::new(Vec::new()),
            expectations: Arc::new(Expectations::new()),
            changed: Notify::new(),
            started: AtomicBool::new(false),
        })
    }

    pub fn backend(&self) -> &Arc<dyn ClusterBackend> {
        &self.backend
    }

    pub fn expectations(&self) -> &Arc<Expectations> {
        &self.expectations
    }

    /// Registers a handler for one kind. Must happen before `start`.
    pub fn subscribe(&self, kind: Kind, handler: Arc<dyn EventHandler>) -> Result<(), ClusterError> {
        if self.started.load(Ordering::SeqCst) {
            return Err(ClusterError::Unavailable(
                "cache already started, handler registration closed".into(),
            ));
        }
        self.handlers.write().push((kind, handler));
        Ok(())
    }

    /// Performs the initial list for every kind, then spawns one dispatch
    /// task per kind. Returns once the mirror is warm.
    pub async fn start(self: &Arc<Self>) -> Result<(), ClusterError> {
        self.started.store(true, Ordering::SeqCst);
        for kind in Kind::ALL {
            // Subscribe before listing so no event between list and loop is lost.
            let receiver = self.backend.watch(kind);
            let objects = self.backend.list(kind).await?;
            for object in objects {
                self.apply_add_or_update(kind, object);
            }
            let cache = Arc::clone(self);
            tokio::spawn(async move {
                cache.dispatch_loop(kind, receiver).await;
            });
        }
        Ok(())
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        kind: Kind,
        mut receiver: tokio::sync::broadcast::Receiver<WatchEvent>,
    ) {
        loop {
            match receiver.recv().await {
                Ok(event) => self.process(kind, event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(kind = %kind, missed, "watch lagged, resyncing");
                    if let Err(error) = self.resync(kind).await {
                        warn!(kind = %kind, %error, "resync failed");
                    }
                }
                Err(RecvError::Closed) => {
                    debug!(kind = %kind, "watch channel closed, dispatcher exiting");
                    return;
                }
            }
        }
    }

    fn process(&self, kind: Kind, event: WatchEvent) {
        match event.event_type {
            EventType::Added | EventType::Modified => {
                self.apply_add_or_update(kind, event.object);
            }
            EventType::Deleted => {
                self.apply_delete(kind, &event.object);
            }
        }
        self.changed.notify_waiters();
    }

    fn apply_add_or_update(&self, kind: Kind, object: ClusterObject) {
        let key = object.id();
        let mirror = self.mirror(kind);
        let previous = mirror.insert(key.clone(), object.clone());

        if let ClusterObject::Sandbox(sandbox) = &object {
            self.by_template
                .entry(sandbox.template().to_string())
                .or_default()
                .insert(key.clone());
        }

        match previous {
            None => self.fan_out(kind, |h| h.on_add(&object)),
            Some(old) => self.fan_out(kind, |h| h.on_update(&old, &object)),
        }
    }

    fn apply_delete(&self, kind: Kind, object: &ClusterObject) {
        let key = object.id();
        let removed = self.mirror(kind).remove(&key);
        if let ClusterObject::Sandbox(sandbox) = object {
            if let Some(mut entry) = self.by_template.get_mut(sandbox.template()) {
                entry.remove(&key);
            }
        }
        self.expectations.clear(&key);
        // Deliver the last known copy if the mirror had one.
        let last = removed.map(|(_, old)| old).unwrap_or_else(|| object.clone());
        self.fan_out(kind, |h| h.on_delete(&last));
    }

    fn fan_out(&self, kind: Kind, mut call: impl FnMut(&Arc<dyn EventHandler>)) {
        for (handler_kind, handler) in self.handlers.read().iter() {
            if *handler_kind == kind {
                call(handler);
            }
        }
    }

    /// Re-list and replay the diff after a lagged watch.
    async fn resync(&self, kind: Kind) -> Result<(), ClusterError> {
        let fresh = self.backend.list(kind).await?;
        let mirror = self.mirror(kind);
        let fresh_keys: HashSet<String> = fresh.iter().map(|o| o.id()).collect();

        let stale: Vec<ClusterObject> = mirror
            .iter()
            .filter(|entry| !fresh_keys.contains(entry.key()))
            .map(|entry| entry.value().clone())
            .collect();
        for object in stale {
            self.apply_delete(kind, &object);
        }
        for object in fresh {
            self.apply_add_or_update(kind, object);
        }
        self.changed.notify_waiters();
        Ok(())
    }

    fn mirror(&self, kind: Kind) -> Arc<DashMap<String, ClusterObject>> {
        self.mirrors
            .get(&kind)
            .map(|entry| Arc::clone(entry.value()))
            .expect("mirror exists for every kind")
    }

    pub fn get(&self, kind: Kind, key: &str) -> Option<ClusterObject> {
        self.mirror(kind).get(key).map(|entry| entry.value().clone())
    }

    pub fn sandbox(&self, key: &str) -> Option<Sandbox> {
        match self.get(Kind::Sandbox, key) {
            Some(ClusterObject::Sandbox(sandbox)) => Some(sandbox),
            _ => None,
        }
    }

    /// Snapshot of all objects of one kind matching the predicate.
    pub fn list(&self, kind: Kind, predicate: impl Fn(&ClusterObject) -> bool) -> Vec<ClusterObject> {
        self.mirror(kind)
            .iter()
            .filter(|entry| predicate(entry.value()))
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn list_sandboxes(&self, predicate: impl Fn(&Sandbox) -> bool) -> Vec<Sandbox> {
        self.mirror(Kind::Sandbox)
            .iter()
            .filter_map(|entry| match entry.value() {
                ClusterObject::Sandbox(sandbox) if predicate(sandbox) => Some(sandbox.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn sandboxes_by_template(&self, template: &str) -> Vec<Sandbox> {
        let Some(keys) = self.by_template.get(template) else {
            return Vec::new();
        };
        let mirror = self.mirror(Kind::Sandbox);
        keys.iter()
            .filter_map(|key| match mirror.get(key).map(|e| e.value().clone()) {
                Some(ClusterObject::Sandbox(sandbox)) => Some(sandbox),
                _ => None,
            })
            .collect()
    }

    pub fn templates(&self) -> Vec<String> {
        self.by_template
            .iter()
            .filter(|entry| !entry.key().is_empty() && !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Waits until the mirrored sandbox satisfies the predicate, bounded by
    /// `timeout`. `Ok(None)` means the sandbox vanished from the mirror.
    pub async fn wait_sandbox(
        &self,
        key: &str,
        timeout: Duration,
        predicate: impl Fn(&Sandbox) -> bool,
    ) -> Result<Option<Sandbox>, ClusterError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.changed.notified();
            match self.sandbox(key) {
                Some(sandbox) if predicate(&sandbox) => return Ok(Some(sandbox)),
                Some(_) => {}
                None => return Ok(None),
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ClusterError::Timeout(format!(
                    "waiting for sandbox {key}"
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::object::{ConditionKind, ObjectMeta, Secret};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(String, String)>>,
    }

    impl EventHandler for Recorder {
        fn on_add(&self, object: &ClusterObject) {
            self.events.lock().push(("add".into(), object.id()));
        }
        fn on_update(&self, _old: &ClusterObject, new: &ClusterObject) {
            self.events.lock().push(("update".into(), new.id()));
        }
        fn on_delete(&self, object: &ClusterObject) {
            self.events.lock().push(("delete".into(), object.id()));
        }
    }

    async fn settle() {
        // Let the dispatch tasks drain the broadcast channel.
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn dispatches_add_update_delete_in_order() {
        let backend: Arc<dyn ClusterBackend> = Arc::new(MemoryBackend::reconciling());
        let cache = Cache::new(Arc::clone(&backend));
        let recorder = Arc::new(Recorder::default());
        cache.subscribe(Kind::Sandbox, recorder.clone()).unwrap();
        cache.start().await.unwrap();

        backend
            .create(ClusterObject::Sandbox(Sandbox::new("default", "sb-1", "base")))
            .await
            .unwrap();
        settle().await;

        let sandbox = backend
            .get(Kind::Sandbox, "default--sb-1")
            .await
            .unwrap()
            .unwrap();
        backend.update(sandbox).await.unwrap();
        backend.mark_deleted(Kind::Sandbox, "default--sb-1").await.unwrap();
        settle().await;

        let events = recorder.events.lock().clone();
        assert_eq!(
            events,
            vec![
                ("add".to_string(), "default--sb-1".to_string()),
                ("update".to_string(), "default--sb-1".to_string()),
                ("delete".to_string(), "default--sb-1".to_string()),
            ]
        );
        assert!(cache.sandbox("default--sb-1").is_none());
    }

    #[tokio::test]
    async fn registration_closes_at_start() {
        let backend: Arc<dyn ClusterBackend> = Arc::new(MemoryBackend::new());
        let cache = Cache::new(backend);
        cache.start().await.unwrap();
        let err = cache
            .subscribe(Kind::Sandbox, Arc::new(Recorder::default()))
            .unwrap_err();
        assert!(matches!(err, ClusterError::Unavailable(_)));
    }

    #[tokio::test]
    async fn template_index_tracks_membership() {
        let backend: Arc<dyn ClusterBackend> = Arc::new(MemoryBackend::reconciling());
        let cache = Cache::new(Arc::clone(&backend));
        cache.start().await.unwrap();

        for name in ["sb-1", "sb-2"] {
            backend
                .create(ClusterObject::Sandbox(Sandbox::new("default", name, "base")))
                .await
                .unwrap();
        }
        backend
            .create(ClusterObject::Sandbox(Sandbox::new("default", "sb-3", "gpu")))
            .await
            .unwrap();
        settle().await;

        assert_eq!(cache.sandboxes_by_template("base").len(), 2);
        assert_eq!(cache.sandboxes_by_template("gpu").len(), 1);

        backend.mark_deleted(Kind::Sandbox, "default--sb-2").await.unwrap();
        settle().await;
        assert_eq!(cache.sandboxes_by_template("base").len(), 1);
    }

    #[tokio::test]
    async fn wait_sandbox_observes_condition_flip() {
        let backend: Arc<dyn ClusterBackend> = Arc::new(MemoryBackend::reconciling());
        let cache = Cache::new(Arc::clone(&backend));
        cache.start().await.unwrap();

        backend
            .create(ClusterObject::Sandbox(Sandbox::new("default", "sb-1", "base")))
            .await
            .unwrap();

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .wait_sandbox("default--sb-1", Duration::from_secs(2), |s| {
                        s.condition(ConditionKind::ClaimAccepted)
                    })
                    .await
            })
        };
        settle().await;

        let mut sandbox = backend
            .get(Kind::Sandbox, "default--sb-1")
            .await
            .unwrap()
            .unwrap()
            .into_sandbox()
            .unwrap();
        sandbox.set_owner("user-1");
        backend.update(ClusterObject::Sandbox(sandbox)).await.unwrap();

        let found = waiter.await.unwrap().unwrap();
        assert!(found.is_some());
    }

    #[tokio::test]
    async fn initial_list_warms_the_mirror() {
        let backend: Arc<dyn ClusterBackend> = Arc::new(MemoryBackend::new());
        backend
            .create(ClusterObject::Secret({
                let mut secret = Secret::new("kruise-system", "api-keys");
                secret.meta = ObjectMeta::new("kruise-system", "api-keys");
                secret
            }))
            .await
            .unwrap();

        let cache = Cache::new(backend);
        cache.start().await.unwrap();
        assert!(cache.get(Kind::Secret, "kruise-system--api-keys").is_some());
    }
}
