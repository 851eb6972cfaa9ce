//! Wire DTOs for the E2B-compatible API, metadata validation and the
//! extension-key envelope.
//!
//! User metadata travels as one JSON annotation on the sandbox; reserved
//! prefixes are carved out for extensions, which are parsed off the
//! metadata map before validation and never stored back.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kruise_cluster::object::{
    ANNOTATION_ENVD_VERSION, ANNOTATION_METADATA, RESERVED_PREFIXES,
};
use kruise_cluster::{Sandbox, SandboxState};
use kruise_manager::{eviction_time, ManagerError};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub const MIN_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;
const DEFAULT_ENVD_VERSION: &str = "0.2.4";

const EXT_IMAGE: &str = "image";
const EXT_INPLACE_TIMEOUT: &str = "inplace-update-timeout-seconds";
const EXT_CSI_VOLUME: &str = "csi-volume-name";
const EXT_CSI_MOUNT_POINT: &str = "csi-mount-point";
const EXT_SKIP_INIT: &str = "skip-init-runtime";
const EXT_RESERVE_FAILED: &str = "reserve-failed-sandbox";

const EXTENSION_KEYS: [&str; 6] = [
    EXT_IMAGE,
    EXT_INPLACE_TIMEOUT,
    EXT_CSI_VOLUME,
    EXT_CSI_MOUNT_POINT,
    EXT_SKIP_INIT,
    EXT_RESERVE_FAILED,
];

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CreateSandboxBody {
    #[serde(rename = "templateID")]
    pub template_id: String,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub auto_pause: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub env_vars: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub secure: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutBody {
    pub timeout_seconds: u64,
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResumeBody {
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateKeyBody {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SandboxDto {
    #[serde(rename = "sandboxID")]
    pub sandbox_id: String,
    #[serde(rename = "templateID")]
    pub template_id: String,
    pub domain: String,
    pub envd_version: String,
    pub envd_access_token: String,
    pub state: String,
    pub metadata: BTreeMap<String, String>,
    pub started_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub cpu_count: u32,
    #[serde(rename = "memoryMB")]
    pub memory_mb: u64,
    #[serde(rename = "diskSizeMB")]
    pub disk_size_mb: u64,
}

impl SandboxDto {
    pub fn from_sandbox(sandbox: &Sandbox, domain: &str) -> Self {
        Self {
            sandbox_id: sandbox.id(),
            template_id: sandbox.template().to_string(),
            domain: domain.to_string(),
            envd_version: sandbox
                .meta
                .annotations
                .get(ANNOTATION_ENVD_VERSION)
                .cloned()
                .unwrap_or_else(|| DEFAULT_ENVD_VERSION.to_string()),
            envd_access_token: sandbox.access_token().to_string(),
            state: state_string(sandbox),
            metadata: decode_metadata(sandbox),
            started_at: sandbox.meta.created_at,
            end_at: eviction_time(sandbox),
            cpu_count: sandbox.spec.cpu_count,
            memory_mb: sandbox.spec.memory_mb,
            disk_size_mb: sandbox.spec.disk_size_mb,
        }
    }
}

fn state_string(sandbox: &Sandbox) -> String {
    if sandbox.meta.deletion_timestamp.is_some() {
        return SandboxState::Terminating.as_str().to_string();
    }
    sandbox.status.state.as_str().to_string()
}

/// User metadata is stored as one JSON annotation; unparseable or absent
/// payloads read as empty.
pub fn decode_metadata(sandbox: &Sandbox) -> BTreeMap<String, String> {
    sandbox
        .meta
        .annotations
        .get(ANNOTATION_METADATA)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

pub fn encode_metadata(metadata: &BTreeMap<String, String>) -> Result<String, ManagerError> {
    serde_json::to_string(metadata).map_err(|err| ManagerError::Internal(err.into()))
}

/// Extension configuration hidden in reserved metadata keys.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtensionOptions {
    pub image: Option<String>,
    pub inplace_update_timeout: Option<Duration>,
    pub csi_volume_name: Option<String>,
    pub csi_mount_point: Option<String>,
    pub skip_init_runtime: bool,
    pub reserve_failed_sandbox: bool,
}

/// Splits recognized extension keys off the metadata map. Reserved-prefix
/// keys that are not recognized extensions are forbidden; everything left
/// must be a qualified metadata key.
pub fn parse_extensions(
    metadata: &mut BTreeMap<String, String>,
) -> Result<ExtensionOptions, ManagerError> {
    let mut options = ExtensionOptions::default();

    let reserved: Vec<String> = metadata
        .keys()
        .filter(|key| RESERVED_PREFIXES.iter().any(|prefix| key.starts_with(prefix)))
        .cloned()
        .collect();

    for key in reserved {
        let value = metadata.remove(&key).unwrap_or_default();
        let suffix = RESERVED_PREFIXES
            .iter()
            .find_map(|prefix| key.strip_prefix(prefix))
            .unwrap_or(&key);
        if !EXTENSION_KEYS.contains(&suffix) {
            return Err(ManagerError::BadRequest(format!(
                "metadata key {key} uses a forbidden prefix"
            )));
        }
        match suffix {
            EXT_IMAGE => options.image = Some(value),
            EXT_INPLACE_TIMEOUT => {
                let seconds: u64 = value.parse().map_err(|_| {
                    ManagerError::BadRequest(format!("invalid {key} value {value}"))
                })?;
                options.inplace_update_timeout = Some(Duration::from_secs(seconds));
            }
            EXT_CSI_VOLUME => options.csi_volume_name = Some(value),
            EXT_CSI_MOUNT_POINT => options.csi_mount_point = Some(value),
            EXT_SKIP_INIT => options.skip_init_runtime = parse_bool(&key, &value)?,
            EXT_RESERVE_FAILED => options.reserve_failed_sandbox = parse_bool(&key, &value)?,
            _ => unreachable!("suffix checked against EXTENSION_KEYS"),
        }
    }

    validate_metadata(metadata)?;
    Ok(options)
}

/// Inverse of [`parse_extensions`], used when a claim is re-issued with
/// the same configuration.
pub fn encode_extensions(options: &ExtensionOptions) -> BTreeMap<String, String> {
    let prefix = RESERVED_PREFIXES[0];
    let mut metadata = BTreeMap::new();
    if let Some(image) = &options.image {
        metadata.insert(format!("{prefix}{EXT_IMAGE}"), image.clone());
    }
    if let Some(timeout) = options.inplace_update_timeout {
        metadata.insert(
            format!("{prefix}{EXT_INPLACE_TIMEOUT}"),
            timeout.as_secs().to_string(),
        );
    }
    if let Some(volume) = &options.csi_volume_name {
        metadata.insert(format!("{prefix}{EXT_CSI_VOLUME}"), volume.clone());
    }
    if let Some(mount_point) = &options.csi_mount_point {
        metadata.insert(format!("{prefix}{EXT_CSI_MOUNT_POINT}"), mount_point.clone());
    }
    if options.skip_init_runtime {
        metadata.insert(format!("{prefix}{EXT_SKIP_INIT}"), "true".to_string());
    }
    if options.reserve_failed_sandbox {
        metadata.insert(format!("{prefix}{EXT_RESERVE_FAILED}"), "true".to_string());
    }
    metadata
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ManagerError> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" | "" => Ok(false),
        other => Err(ManagerError::BadRequest(format!(
            "invalid boolean {other} for {key}"
        ))),
    }
}

/// Qualified-name validation for the remaining user metadata keys: an
/// optional DNS-ish prefix followed by `[A-Za-z0-9._-]+`.
pub fn validate_metadata(metadata: &BTreeMap<String, String>) -> Result<(), ManagerError> {
    for key in metadata.keys() {
        let (prefix, name) = match key.rsplit_once('/') {
            Some((prefix, name)) => (Some(prefix), name),
            None => (None, key.as_str()),
        };
        if name.is_empty() || !name.chars().all(is_name_char) {
            return Err(ManagerError::BadRequest(format!(
                "metadata key {key} is unqualified"
            )));
        }
        if let Some(prefix) = prefix {
            if prefix.is_empty()
                || !prefix
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-')
            {
                return Err(ManagerError::BadRequest(format!(
                    "metadata key {key} is unqualified"
                )));
            }
        }
    }
    Ok(())
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'
}

/// Timeout window accepted by the public API.
pub fn validate_timeout(seconds: u64, max: Duration) -> Result<Duration, ManagerError> {
    if seconds < MIN_TIMEOUT_SECONDS {
        return Err(ManagerError::BadRequest(format!(
            "timeout {seconds}s below minimum of {MIN_TIMEOUT_SECONDS}s"
        )));
    }
    let requested = Duration::from_secs(seconds);
    if requested > max {
        return Err(ManagerError::BadRequest(format!(
            "timeout {seconds}s above maximum of {}s",
            max.as_secs()
        )));
    }
    Ok(requested)
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ApiKeyDto {
    pub id: uuid::Uuid,
    pub name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    /// Only set on creation; listings never echo key material.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl ApiKeyDto {
    pub fn redacted(record: kruise_manager::ApiKeyRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            created_by: record.created_by,
            created_at: record.created_at,
            last_used: record.last_used,
            key: None,
        }
    }

    pub fn with_key(record: kruise_manager::ApiKeyRecord) -> Self {
        let key = record.key.clone();
        let mut dto = Self::redacted(record);
        dto.key = Some(key);
        dto
    }
}
