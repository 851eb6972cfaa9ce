//! Cluster-store layer for the sandbox orchestrator.
//!
//! The orchestrator never talks to pods directly for lifecycle changes; it
//! reads, patches and watches declarative objects and lets the external
//! reconciler do the work. This crate provides the object model, the
//! [`ClusterBackend`] trait that abstracts the store, an in-memory backend
//! with a zero-latency reconciler for tests and standalone mode, the
//! informer [`Cache`] with per-kind event dispatch, resource-version
//! [`Expectations`] for read-your-writes, and the [`mutate_sandbox`]
//! patch-retry helper.

pub mod backend;
pub mod cache;
pub mod expectations;
pub mod memory;
pub mod mutate;
pub mod object;

pub use backend::{ClusterBackend, ClusterError};
pub use cache::{Cache, EventHandler};
pub use expectations::{Expectations, TransientNotReady};
pub use memory::MemoryBackend;
pub use mutate::{mutate_sandbox, mutate_secret};
pub use object::{
    ClusterObject, Condition, ConditionKind, EventType, Kind, ObjectMeta, PersistentVolume, Pod,
    Sandbox, SandboxSpec, SandboxState, SandboxStatus, Secret, WatchEvent,
};
