//! Error taxonomy for the sandbox manager.
//!
//! Transient conditions (patch conflicts, expectation lag) are retried
//! locally by the callers that can; everything else surfaces to the wire
//! layer, which maps each variant to one HTTP status.

use kruise_cluster::{ClusterError, TransientNotReady};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("no available sandbox in pool {0}")]
    NoStock(String),
    #[error("csi mount failed: {0}")]
    CsiMountFailed(String),
    #[error("inplace update timed out for {0}")]
    InplaceUpdateTimeout(String),
    #[error("upstream failure: {0}")]
    Upstream(String),
    #[error("deadline exceeded: {0}")]
    Timeout(String),
    #[error("too many in-flight claims")]
    Busy,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<ClusterError> for ManagerError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NotFound(kind, key) => ManagerError::NotFound(format!("{kind} {key}")),
            ClusterError::Conflict(key) => ManagerError::Conflict(key),
            ClusterError::AlreadyExists(kind, key) => {
                ManagerError::Conflict(format!("{kind} {key} already exists"))
            }
            ClusterError::Timeout(what) => ManagerError::Timeout(what),
            ClusterError::Unavailable(reason) => ManagerError::Internal(anyhow::anyhow!(reason)),
            ClusterError::Internal(inner) => ManagerError::Internal(inner),
        }
    }
}

impl From<TransientNotReady> for ManagerError {
    fn from(err: TransientNotReady) -> Self {
        ManagerError::Timeout(err.to_string())
    }
}
