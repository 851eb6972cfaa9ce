//! Object model for the declarative cluster store.
//!
//! Four kinds are mirrored locally: sandboxes, pods, secrets and persistent
//! volumes. Objects are plain data; every mutation goes through the backend
//! and is only considered durable once the watch stream returns it with a
//! fresh resource version.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Label carrying the pool/template a sandbox was produced from.
pub const LABEL_TEMPLATE: &str = "agents.kruise.io/template";

/// Reserved annotation prefixes. User-supplied metadata must not use them.
pub const RESERVED_PREFIXES: [&str; 2] = ["e2b.agents.kruise.io/", "agents.kruise.io/"];

pub const ANNOTATION_OWNER: &str = "agents.kruise.io/owner";
pub const ANNOTATION_ACCESS_TOKEN: &str = "agents.kruise.io/access-token";
pub const ANNOTATION_SESSION_ID: &str = "agents.kruise.io/session-id";
pub const ANNOTATION_ENVD_URL: &str = "agents.kruise.io/envd-url";
pub const ANNOTATION_CLAIMED_AT: &str = "agents.kruise.io/claimed-at";
pub const ANNOTATION_CSI_PUBLISH: &str = "agents.kruise.io/csi-publish-request";
pub const ANNOTATION_METADATA: &str = "agents.kruise.io/metadata";
pub const ANNOTATION_ENVD_VERSION: &str = "agents.kruise.io/envd-version";

/// Template-level pool flags, read from the template secret's annotations.
pub const ANNOTATION_POOL_INIT_RUNTIME: &str = "agents.kruise.io/should-init-runtime";
pub const ANNOTATION_POOL_WORKERS: &str = "agents.kruise.io/workers";
pub const ANNOTATION_POOL_CREATE_QPS: &str = "agents.kruise.io/create-qps";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Sandbox,
    Pod,
    Secret,
    Volume,
}

impl Kind {
    pub const ALL: [Kind; 4] = [Kind::Sandbox, Kind::Pod, Kind::Secret, Kind::Volume];

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Sandbox => "sandbox",
            Kind::Pod => "pod",
            Kind::Secret => "secret",
            Kind::Volume => "volume",
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shared object metadata. `resource_version` is an opaque monotonic token
/// issued by the store on every write.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    pub namespace: String,
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub resource_version: String,
    pub created_at: Option<DateTime<Utc>>,
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl ObjectMeta {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            created_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Globally unique object key, `<namespace>--<name>`.
    pub fn id(&self) -> String {
        format!("{}--{}", self.namespace, self.name)
    }
}

/// Splits a `<namespace>--<name>` key back into its components.
pub fn split_id(id: &str) -> Option<(&str, &str)> {
    id.split_once("--")
}

/// Numeric view of an opaque resource version, for ordering comparisons.
/// Unparseable tokens order as zero.
pub fn rv_value(rv: &str) -> u64 {
    rv.parse().unwrap_or(0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SandboxState {
    Pending,
    Running,
    Paused,
    Terminating,
    Failed,
}

impl SandboxState {
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxState::Pending => "pending",
            SandboxState::Running => "running",
            SandboxState::Paused => "paused",
            SandboxState::Terminating => "terminating",
            SandboxState::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionKind {
    Ready,
    Paused,
    ClaimAccepted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    pub kind: ConditionKind,
    pub status: bool,
    pub last_transition: DateTime<Utc>,
}

/// Desired state written by the manager, acted on by the cluster reconciler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxSpec {
    pub paused: bool,
    pub shutdown_time: Option<DateTime<Utc>>,
    pub pause_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub cpu_count: u32,
    #[serde(default)]
    pub memory_mb: u64,
    #[serde(default)]
    pub disk_size_mb: u64,
}

/// Observed state written by the reconciler, read by the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxStatus {
    pub state: SandboxState,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub ip: String,
    /// Image currently running, used to observe inplace updates landing.
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl Default for SandboxStatus {
    fn default() -> Self {
        Self {
            state: SandboxState::Pending,
            reason: String::new(),
            ip: String::new(),
            image: String::new(),
            conditions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sandbox {
    pub meta: ObjectMeta,
    pub spec: SandboxSpec,
    pub status: SandboxStatus,
}

impl Sandbox {
    pub fn new(namespace: &str, name: &str, template: &str) -> Self {
        let mut meta = ObjectMeta::new(namespace, name);
        meta.labels.insert(LABEL_TEMPLATE.to_string(), template.to_string());
        Self {
            meta,
            spec: SandboxSpec::default(),
            status: SandboxStatus::default(),
        }
    }

    pub fn id(&self) -> String {
        self.meta.id()
    }

    pub fn template(&self) -> &str {
        self.meta.labels.get(LABEL_TEMPLATE).map(String::as_str).unwrap_or("")
    }

    /// Owning user, empty while the sandbox sits in its pool.
    pub fn owner(&self) -> &str {
        self.meta
            .annotations
            .get(ANNOTATION_OWNER)
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn set_owner(&mut self, user: &str) {
        self.meta
            .annotations
            .insert(ANNOTATION_OWNER.to_string(), user.to_string());
    }

    pub fn access_token(&self) -> &str {
        self.meta
            .annotations
            .get(ANNOTATION_ACCESS_TOKEN)
            .map(String::as_str)
            .unwrap_or("")
    }

    pub fn condition(&self, kind: ConditionKind) -> bool {
        self.status
            .conditions
            .iter()
            .find(|c| c.kind == kind)
            .map(|c| c.status)
            .unwrap_or(false)
    }

    pub fn set_condition(&mut self, kind: ConditionKind, status: bool) {
        match self.status.conditions.iter_mut().find(|c| c.kind == kind) {
            Some(existing) => {
                if existing.status != status {
                    existing.status = status;
                    existing.last_transition = Utc::now();
                }
            }
            None => self.status.conditions.push(Condition {
                kind,
                status,
                last_transition: Utc::now(),
            }),
        }
    }

    /// Available for claiming: unowned, ready, not being torn down.
    pub fn is_available(&self) -> bool {
        self.owner().is_empty()
            && self.meta.deletion_timestamp.is_none()
            && self.status.state == SandboxState::Running
            && self.condition(ConditionKind::Ready)
    }
}

/// Pod mirror, only the fields the manager consumes: the address for peer
/// discovery and the labels it is selected by.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pod {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub ip: String,
    #[serde(default)]
    pub ready: bool,
}

impl Pod {
    pub fn new(namespace: &str, name: &str, ip: &str) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            ip: ip.to_string(),
            ready: true,
        }
    }
}

/// Secret mirror. Values are utf-8 payloads (JSON records for the key store).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Secret {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Secret {
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            meta: ObjectMeta::new(namespace, name),
            data: BTreeMap::new(),
        }
    }
}

/// Persistent volume mirror, consumed by the CSI mount provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistentVolume {
    pub meta: ObjectMeta,
    #[serde(default)]
    pub driver: String,
    #[serde(default)]
    pub volume_handle: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ClusterObject {
    Sandbox(Sandbox),
    Pod(Pod),
    Secret(Secret),
    Volume(PersistentVolume),
}

impl ClusterObject {
    pub fn kind(&self) -> Kind {
        match self {
            ClusterObject::Sandbox(_) => Kind::Sandbox,
            ClusterObject::Pod(_) => Kind::Pod,
            ClusterObject::Secret(_) => Kind::Secret,
            ClusterObject::Volume(_) => Kind::Volume,
        }
    }

    pub fn meta(&self) -> &ObjectMeta {
        match self {
            ClusterObject::Sandbox(s) => &s.meta,
            ClusterObject::Pod(p) => &p.meta,
            ClusterObject::Secret(s) => &s.meta,
            ClusterObject::Volume(v) => &v.meta,
        }
    }

    pub fn meta_mut(&mut self) -> &mut ObjectMeta {
        match self {
            ClusterObject::Sandbox(s) => &mut s.meta,
            ClusterObject::Pod(p) => &mut p.meta,
            ClusterObject::Secret(s) => &mut s.meta,
            ClusterObject::Volume(v) => &mut v.meta,
        }
    }

    pub fn id(&self) -> String {
        self.meta().id()
    }

    pub fn as_sandbox(&self) -> Option<&Sandbox> {
        match self {
            ClusterObject::Sandbox(s) => Some(s),
            _ => None,
        }
    }

    pub fn into_sandbox(self) -> Option<Sandbox> {
        match self {
            ClusterObject::Sandbox(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Added,
    Modified,
    Deleted,
}

/// One entry on the watch stream.
#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: EventType,
    pub object: ClusterObject,
}
