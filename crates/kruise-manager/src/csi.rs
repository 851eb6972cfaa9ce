//! CSI mount plumbing.
//!
//! The manager never mounts anything itself. It builds a
//! `NodePublishVolumeRequest` for the volume's driver, base64-encodes it
//! and patches it into a sandbox annotation; the in-sandbox runtime reads
//! the annotation and performs the publish.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use kruise_cluster::{Cache, ClusterObject, Kind, PersistentVolume};
use serde::{Deserialize, Serialize};

use crate::error::ManagerError;

/// Wire shape of the publish request handed to the in-sandbox runtime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodePublishVolumeRequest {
    pub volume_id: String,
    pub target_path: String,
    pub driver: String,
    #[serde(default)]
    pub volume_context: BTreeMap<String, String>,
    #[serde(default)]
    pub readonly: bool,
}

/// Builds the publish request for one driver. Registered per driver name;
/// drivers with no special handling fall back to [`GenericProvider`].
pub trait CsiProvider: Send + Sync + 'static {
    fn publish_request(
        &self,
        volume: &PersistentVolume,
        mount_point: &str,
    ) -> Result<NodePublishVolumeRequest, ManagerError>;
}

pub struct GenericProvider;

impl CsiProvider for GenericProvider {
    fn publish_request(
        &self,
        volume: &PersistentVolume,
        mount_point: &str,
    ) -> Result<NodePublishVolumeRequest, ManagerError> {
        if !mount_point.starts_with('/') {
            return Err(ManagerError::BadRequest(format!(
                "csi mount point must be absolute, got {mount_point}"
            )));
        }
        Ok(NodePublishVolumeRequest {
            volume_id: volume.volume_handle.clone(),
            target_path: mount_point.to_string(),
            driver: volume.driver.clone(),
            volume_context: volume.attributes.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            readonly: volume.read_only,
        })
    }
}

pub struct CsiMounter {
    cache: Arc<Cache>,
    providers: BTreeMap<String, Arc<dyn CsiProvider>>,
    fallback: Arc<dyn CsiProvider>,
}

impl CsiMounter {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self {
            cache,
            providers: BTreeMap::new(),
            fallback: Arc::new(GenericProvider),
        }
    }

    pub fn register(&mut self, driver: &str, provider: Arc<dyn CsiProvider>) {
        self.providers.insert(driver.to_string(), provider);
    }

    fn provider(&self, driver: &str) -> &Arc<dyn CsiProvider> {
        self.providers.get(driver).unwrap_or(&self.fallback)
    }

    /// Looks up the volume by name, builds the publish request and returns
    /// it base64-encoded, ready to be patched into the sandbox annotation.
    pub fn encoded_publish_request(
        &self,
        volume_name: &str,
        mount_point: &str,
    ) -> Result<String, ManagerError> {
        let volume = self
            .cache
            .list(Kind::Volume, |object| object.meta().name == volume_name)
            .into_iter()
            .find_map(|object| match object {
                ClusterObject::Volume(volume) => Some(volume),
                _ => None,
            })
            .ok_or_else(|| {
                ManagerError::CsiMountFailed(format!("volume {volume_name} not found"))
            })?;

        let request = self
            .provider(&volume.driver)
            .publish_request(&volume, mount_point)?;
        let json = serde_json::to_vec(&request)
            .map_err(|err| ManagerError::CsiMountFailed(err.to_string()))?;
        Ok(STANDARD.encode(json))
    }
}

/// Decodes a previously encoded publish request, used by tests and by the
/// runtime-facing debugging endpoints.
pub fn decode_publish_request(encoded: &str) -> Result<NodePublishVolumeRequest, ManagerError> {
    let raw = STANDARD
        .decode(encoded)
        .map_err(|err| ManagerError::BadRequest(format!("invalid csi payload: {err}")))?;
    serde_json::from_slice(&raw)
        .map_err(|err| ManagerError::BadRequest(format!("invalid csi payload: {err}")))
}
