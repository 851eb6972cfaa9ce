//! Cluster-persisted API-key registry.
//!
//! All replicas share one secret whose data map is `UUID -> JSON(record)`.
//! Writes go through the optimistic-concurrency helper so concurrent
//! replicas converge; a periodic refresh re-reads the secret and folds
//! remote changes into the in-memory indexes (lookup by id and by raw key).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use kruise_cluster::{mutate_secret, ClusterBackend, ClusterObject, Kind, Secret};
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ManagerError;

pub const DEFAULT_KEY_SECRET_NAME: &str = "e2b-api-keys";
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(600);
pub const ADMIN_USER: &str = "admin";

const CREATE_KEY_ATTEMPTS: usize = 100;
const KEY_PREFIX: &str = "e2b_";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub key: String,
    pub name: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
}

pub struct KeyStore {
    backend: Arc<dyn ClusterBackend>,
    secret_key: String,
    namespace: String,
    secret_name: String,
    by_id: DashMap<Uuid, ApiKeyRecord>,
    by_key: DashMap<String, ApiKeyRecord>,
}

impl KeyStore {
    pub fn new(backend: Arc<dyn ClusterBackend>, namespace: &str) -> Self {
        Self {
            backend,
            secret_key: format!("{namespace}--{DEFAULT_KEY_SECRET_NAME}"),
            namespace: namespace.to_string(),
            secret_name: DEFAULT_KEY_SECRET_NAME.to_string(),
            by_id: DashMap::new(),
            by_key: DashMap::new(),
        }
    }

    /// Ensures the backing secret exists, seeding it with one admin key
    /// (supplied through config or freshly generated), then warms the
    /// indexes. Returns the admin key when it was just created so the
    /// operator can read it from the logs exactly once.
    pub async fn bootstrap(&self, admin_key: Option<String>) -> Result<Option<String>, ManagerError> {
        let existing = self.backend.get(Kind::Secret, &self.secret_key).await?;
        let created_admin = match existing {
            Some(_) => None,
            None => {
                let key = admin_key.unwrap_or_else(generate_key);
                let record = ApiKeyRecord {
                    id: Uuid::new_v4(),
                    key: key.clone(),
                    name: "admin".to_string(),
                    created_by: ADMIN_USER.to_string(),
                    created_at: Utc::now(),
                    last_used: None,
                };
                let mut secret = Secret::new(&self.namespace, &self.secret_name);
                secret.data.insert(
                    record.id.to_string(),
                    serde_json::to_string(&record)
                        .map_err(|err| ManagerError::Internal(err.into()))?,
                );
                self.backend.create(ClusterObject::Secret(secret)).await?;
                info!(name = %self.secret_name, "api key secret created with admin entry");
                Some(key)
            }
        };
        self.refresh().await?;
        Ok(created_admin)
    }

    /// Re-reads the secret and converges both indexes, dropping entries no
    /// longer present.
    pub async fn refresh(&self) -> Result<(), ManagerError> {
        let secret = match self.backend.get(Kind::Secret, &self.secret_key).await? {
            Some(ClusterObject::Secret(secret)) => secret,
            _ => return Err(ManagerError::NotFound(format!("secret {}", self.secret_key))),
        };

        let mut seen_ids = Vec::with_capacity(secret.data.len());
        for (id, raw) in &secret.data {
            match serde_json::from_str::<ApiKeyRecord>(raw) {
                Ok(record) => {
                    seen_ids.push(record.id);
                    self.by_id.insert(record.id, record.clone());
                    self.by_key.insert(record.key.clone(), record);
                }
                Err(error) => warn!(id = %id, %error, "skipping unparseable api key entry"),
            }
        }
        self.by_id.retain(|id, _| seen_ids.contains(id));
        self.by_key.retain(|_, record| seen_ids.contains(&record.id));
        Ok(())
    }

    /// Spawns the periodic refresh loop.
    pub fn spawn_refresh_loop(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(error) = store.refresh().await {
                    warn!(%error, "api key refresh failed");
                }
            }
        })
    }

    pub fn load_by_key(&self, key: &str) -> Option<ApiKeyRecord> {
        let record = self.by_key.get(key).map(|entry| entry.value().clone())?;
        // Usage time is tracked in memory; the secret is not rewritten per
        // request.
        if let Some(mut entry) = self.by_id.get_mut(&record.id) {
            entry.last_used = Some(Utc::now());
        }
        Some(record)
    }

    pub fn load_by_id(&self, id: Uuid) -> Option<ApiKeyRecord> {
        self.by_id.get(&id).map(|entry| entry.value().clone())
    }

    pub fn list_by_owner(&self, user: &str) -> Vec<ApiKeyRecord> {
        let mut records: Vec<ApiKeyRecord> = self
            .by_id
            .iter()
            .filter(|entry| entry.value().created_by == user)
            .map(|entry| entry.value().clone())
            .collect();
        records.sort_by_key(|record| record.created_at);
        records
    }

    pub async fn create_key(&self, user: &str, name: &str) -> Result<ApiKeyRecord, ManagerError> {
        for _ in 0..CREATE_KEY_ATTEMPTS {
            let record = ApiKeyRecord {
                id: Uuid::new_v4(),
                key: generate_key(),
                name: name.to_string(),
                created_by: user.to_string(),
                created_at: Utc::now(),
                last_used: None,
            };

            if self.by_id.contains_key(&record.id) || self.by_key.contains_key(&record.key) {
                continue;
            }

            let id_string = record.id.to_string();
            let payload = serde_json::to_string(&record)
                .map_err(|err| ManagerError::Internal(err.into()))?;
            let mut collided = false;
            mutate_secret(&self.backend, &self.secret_key, |secret| {
                if secret.data.contains_key(&id_string) {
                    collided = true;
                } else {
                    secret.data.insert(id_string.clone(), payload.clone());
                }
                Ok(())
            })
            .await?;
            if collided {
                continue;
            }

            self.by_id.insert(record.id, record.clone());
            self.by_key.insert(record.key.clone(), record.clone());
            info!(key_id = %record.id, user, "api key created");
            return Ok(record);
        }
        Err(ManagerError::Internal(anyhow::anyhow!(
            "could not generate a unique api key"
        )))
    }

    pub async fn delete_by_id(&self, id: Uuid) -> Result<(), ManagerError> {
        let record = self
            .load_by_id(id)
            .ok_or_else(|| ManagerError::NotFound(format!("api key {id}")))?;

        let id_string = id.to_string();
        mutate_secret(&self.backend, &self.secret_key, |secret| {
            secret.data.remove(&id_string);
            Ok(())
        })
        .await?;

        self.by_id.remove(&id);
        self.by_key.remove(&record.key);
        info!(key_id = %id, "api key deleted");
        Ok(())
    }

    pub async fn delete_key(&self, key: &str) -> Result<(), ManagerError> {
        let record = self
            .by_key
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ManagerError::NotFound("api key".to_string()))?;
        self.delete_by_id(record.id).await
    }
}

fn generate_key() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(40)
        .map(char::from)
        .collect();
    format!("{KEY_PREFIX}{suffix}")
}
