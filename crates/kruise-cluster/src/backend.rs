//! Backend contract the manager consumes.
//!
//! The real control plane (the CRD reconciler that creates pods) lives
//! outside this process; the manager only reads, patches and watches
//! objects through this trait. Updates are optimistic: the submitted
//! object's resource version must match the stored one or the write is
//! rejected with [`ClusterError::Conflict`].

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::object::{ClusterObject, Kind, WatchEvent};

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{0} {1} not found")]
    NotFound(Kind, String),
    #[error("stale resource version for {0}")]
    Conflict(String),
    #[error("{0} {1} already exists")]
    AlreadyExists(Kind, String),
    #[error("cluster store unavailable: {0}")]
    Unavailable(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[async_trait]
pub trait ClusterBackend: Send + Sync + 'static {
    /// Reads the current copy of an object by its `<namespace>--<name>` key.
    async fn get(&self, kind: Kind, key: &str) -> Result<Option<ClusterObject>, ClusterError>;

    /// Lists all objects of one kind. Snapshot consistency only.
    async fn list(&self, kind: Kind) -> Result<Vec<ClusterObject>, ClusterError>;

    /// Creates a new object; assigns the initial resource version.
    async fn create(&self, object: ClusterObject) -> Result<String, ClusterError>;

    /// Replaces an object under optimistic concurrency. Returns the new
    /// resource version on success.
    async fn update(&self, object: ClusterObject) -> Result<String, ClusterError>;

    /// Sets the deletion marker. The reconciler tears the object down and
    /// the watch eventually reports the delete. Idempotent.
    async fn mark_deleted(&self, kind: Kind, key: &str) -> Result<(), ClusterError>;

    /// Subscribes to the raw watch stream for one kind. Receivers that lag
    /// must re-list and treat replayed updates as idempotent.
    fn watch(&self, kind: Kind) -> broadcast::Receiver<WatchEvent>;
}
