//! Operations on a single sandbox.
//!
//! Every mutation is patch-then-expect: the write goes through the
//! cluster backend with conflict retries, and the resulting resource
//! version is recorded so later cache reads can enforce read-your-writes.
//! Two clocks govern eviction: `shutdown_time` (hard kill) and
//! `pause_time` (auto-pause); the reconciler fires whichever comes first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kruise_cluster::object::ANNOTATION_CSI_PUBLISH;
use kruise_cluster::{mutate_sandbox, Cache, ClusterObject, Kind, Sandbox, SandboxState};
use tracing::{info, instrument};

use crate::agent::{AgentClient, HEADER_ACCESS_TOKEN};
use crate::error::ManagerError;

#[derive(Debug, Clone, Copy)]
pub struct TimeoutOptions {
    pub timeout: Duration,
    pub auto_pause: bool,
}

/// Effective eviction instant: the earlier of the two clocks.
pub fn eviction_time(sandbox: &Sandbox) -> Option<DateTime<Utc>> {
    match (sandbox.spec.shutdown_time, sandbox.spec.pause_time) {
        (Some(shutdown), Some(pause)) => Some(shutdown.min(pause)),
        (Some(shutdown), None) => Some(shutdown),
        (None, Some(pause)) => Some(pause),
        (None, None) => None,
    }
}

#[derive(Clone)]
pub struct SandboxHandle {
    key: String,
    cache: Arc<Cache>,
    agent: AgentClient,
    max_timeout: Duration,
}

impl SandboxHandle {
    pub fn new(key: &str, cache: Arc<Cache>, agent: AgentClient, max_timeout: Duration) -> Self {
        Self {
            key: key.to_string(),
            cache,
            agent,
            max_timeout,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Latest durable copy, read from the backend so preconditions are not
    /// checked against a stale mirror.
    pub async fn current(&self) -> Result<Sandbox, ManagerError> {
        self.cache
            .backend()
            .get(Kind::Sandbox, &self.key)
            .await?
            .and_then(ClusterObject::into_sandbox)
            .ok_or_else(|| ManagerError::NotFound(format!("sandbox {}", self.key)))
    }

    /// Sets the deletion marker; the reconciler tears the pod down and the
    /// watch reports the delete. Safe to call repeatedly while the sandbox
    /// is terminating.
    #[instrument(skip(self), fields(sandbox_id = %self.key))]
    pub async fn kill(&self) -> Result<(), ManagerError> {
        self.current().await?;
        self.cache
            .backend()
            .mark_deleted(Kind::Sandbox, &self.key)
            .await?;
        info!(sandbox_id = %self.key, "sandbox kill requested");
        Ok(())
    }

    /// Pauses a running sandbox. Both eviction clocks are widened to the
    /// outer bound so a paused sandbox is not reaped under the caller.
    #[instrument(skip(self), fields(sandbox_id = %self.key))]
    pub async fn pause(&self) -> Result<(), ManagerError> {
        let current = self.current().await?;
        if current.status.state != SandboxState::Running {
            return Err(ManagerError::Conflict(format!(
                "sandbox {} is {}, pause requires running",
                self.key,
                current.status.state.as_str()
            )));
        }

        let outer = Utc::now() + chrono_duration(self.max_timeout);
        let had_pause_time = current.spec.pause_time.is_some();
        mutate_sandbox(self.cache.backend(), self.cache.expectations(), &self.key, |s| {
            s.spec.paused = true;
            s.spec.shutdown_time = Some(outer);
            if had_pause_time {
                s.spec.pause_time = Some(outer);
            }
            Ok(())
        })
        .await?;
        info!(sandbox_id = %self.key, "sandbox paused");
        Ok(())
    }

    /// Resumes a paused sandbox with a fresh timeout in the mode the
    /// sandbox was created with.
    #[instrument(skip(self), fields(sandbox_id = %self.key))]
    pub async fn resume(&self, timeout: Duration) -> Result<(), ManagerError> {
        let current = self.current().await?;
        if current.status.state != SandboxState::Paused {
            return Err(ManagerError::Conflict(format!(
                "sandbox {} is {}, resume requires paused",
                self.key,
                current.status.state.as_str()
            )));
        }

        let options = TimeoutOptions {
            timeout,
            auto_pause: current.spec.pause_time.is_some(),
        };
        let (shutdown, pause) = self.clocks(options)?;
        mutate_sandbox(self.cache.backend(), self.cache.expectations(), &self.key, |s| {
            s.spec.paused = false;
            s.spec.shutdown_time = Some(shutdown);
            s.spec.pause_time = pause;
            Ok(())
        })
        .await?;
        info!(sandbox_id = %self.key, "sandbox resumed");
        Ok(())
    }

    /// Rewrites the eviction clocks.
    #[instrument(skip(self), fields(sandbox_id = %self.key))]
    pub async fn save_timeout(&self, options: TimeoutOptions) -> Result<(), ManagerError> {
        let current = self.current().await?;
        if current.status.state == SandboxState::Terminating
            || current.meta.deletion_timestamp.is_some()
        {
            return Err(ManagerError::Conflict(format!(
                "sandbox {} is terminating",
                self.key
            )));
        }

        let (shutdown, pause) = self.clocks(options)?;
        mutate_sandbox(self.cache.backend(), self.cache.expectations(), &self.key, |s| {
            s.spec.shutdown_time = Some(shutdown);
            s.spec.pause_time = pause;
            Ok(())
        })
        .await?;
        Ok(())
    }

    fn clocks(
        &self,
        options: TimeoutOptions,
    ) -> Result<(DateTime<Utc>, Option<DateTime<Utc>>), ManagerError> {
        if options.timeout.is_zero() {
            return Err(ManagerError::BadRequest("timeout must be non-zero".into()));
        }
        if options.timeout > self.max_timeout {
            return Err(ManagerError::BadRequest(format!(
                "timeout exceeds maximum of {}s",
                self.max_timeout.as_secs()
            )));
        }
        let now = Utc::now();
        if options.auto_pause {
            Ok((
                now + chrono_duration(self.max_timeout),
                Some(now + chrono_duration(options.timeout)),
            ))
        } else {
            Ok((now + chrono_duration(options.timeout), None))
        }
    }

    /// Opens an HTTP request against the sandbox's agent, carrying the
    /// sandbox access token. The response is handed back untouched so the
    /// proxy can stream it.
    pub async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        port: u16,
        headers: &HashMap<String, String>,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, ManagerError> {
        let sandbox = self
            .cache
            .sandbox(&self.key)
            .ok_or_else(|| ManagerError::NotFound(format!("sandbox {}", self.key)))?;
        if sandbox.status.ip.is_empty() {
            return Err(ManagerError::Upstream(format!(
                "sandbox {} has no address yet",
                self.key
            )));
        }

        let url = format!("http://{}:{}{}", sandbox.status.ip, port, path);
        let mut request = self
            .agent
            .http()
            .request(method, &url)
            .header(HEADER_ACCESS_TOKEN, sandbox.access_token());
        for (name, value) in headers {
            request = request.header(name, value);
        }
        if !body.is_empty() {
            request = request.body(body);
        }
        request
            .send()
            .await
            .map_err(|err| ManagerError::Upstream(format!("sandbox {}: {err}", self.key)))
    }

    /// Patches the encoded publish request into the mount annotation; the
    /// in-sandbox runtime picks it up and performs the publish. The driver
    /// name is carried inside the encoded request.
    #[instrument(skip(self, encoded_request), fields(sandbox_id = %self.key))]
    pub async fn csi_mount(&self, driver: &str, encoded_request: &str) -> Result<(), ManagerError> {
        let value = encoded_request.to_string();
        mutate_sandbox(self.cache.backend(), self.cache.expectations(), &self.key, |s| {
            s.meta
                .annotations
                .insert(ANNOTATION_CSI_PUBLISH.to_string(), value.clone());
            Ok(())
        })
        .await
        .map_err(|err| ManagerError::CsiMountFailed(err.to_string()))?;
        Ok(())
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::max_value())
}

#[cfg(test)]
mod tests {
    use super::*;
    use kruise_cluster::{ClusterBackend, MemoryBackend};

    const MAX_TIMEOUT: Duration = Duration::from_secs(2_592_000);

    async fn handle_for(name: &str) -> (Arc<Cache>, SandboxHandle) {
        let backend: Arc<dyn ClusterBackend> = Arc::new(MemoryBackend::reconciling());
        backend
            .create(ClusterObject::Sandbox(Sandbox::new("default", name, "base")))
            .await
            .unwrap();
        let cache = Cache::new(backend);
        cache.start().await.unwrap();
        let handle = SandboxHandle::new(
            &format!("default--{name}"),
            Arc::clone(&cache),
            AgentClient::new(Duration::from_secs(5)).unwrap(),
            MAX_TIMEOUT,
        );
        (cache, handle)
    }

    fn close_to(actual: DateTime<Utc>, expected: DateTime<Utc>) -> bool {
        (actual - expected).num_seconds().abs() <= 5
    }

    #[tokio::test]
    async fn save_timeout_sets_single_clock_without_autopause() {
        let (_cache, handle) = handle_for("sb-1").await;
        handle
            .save_timeout(TimeoutOptions {
                timeout: Duration::from_secs(600),
                auto_pause: false,
            })
            .await
            .unwrap();

        let sandbox = handle.current().await.unwrap();
        assert!(sandbox.spec.pause_time.is_none());
        assert!(close_to(
            sandbox.spec.shutdown_time.unwrap(),
            Utc::now() + chrono::Duration::seconds(600)
        ));
    }

    #[tokio::test]
    async fn autopause_sets_both_clocks() {
        let (_cache, handle) = handle_for("sb-1").await;
        handle
            .save_timeout(TimeoutOptions {
                timeout: Duration::from_secs(300),
                auto_pause: true,
            })
            .await
            .unwrap();

        let sandbox = handle.current().await.unwrap();
        assert!(close_to(
            sandbox.spec.pause_time.unwrap(),
            Utc::now() + chrono::Duration::seconds(300)
        ));
        assert!(close_to(
            sandbox.spec.shutdown_time.unwrap(),
            Utc::now() + chrono::Duration::seconds(MAX_TIMEOUT.as_secs() as i64)
        ));
        assert_eq!(
            eviction_time(&sandbox).unwrap(),
            sandbox.spec.pause_time.unwrap()
        );
    }

    #[tokio::test]
    async fn zero_timeout_is_rejected() {
        let (_cache, handle) = handle_for("sb-1").await;
        let err = handle
            .save_timeout(TimeoutOptions {
                timeout: Duration::ZERO,
                auto_pause: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ManagerError::BadRequest(_)));
    }

    #[tokio::test]
    async fn pause_then_resume_restores_requested_timeout() {
        let (_cache, handle) = handle_for("sb-1").await;
        handle
            .save_timeout(TimeoutOptions {
                timeout: Duration::from_secs(300),
                auto_pause: true,
            })
            .await
            .unwrap();

        handle.pause().await.unwrap();
        let paused = handle.current().await.unwrap();
        assert_eq!(paused.status.state, SandboxState::Paused);
        assert!(close_to(
            paused.spec.shutdown_time.unwrap(),
            Utc::now() + chrono::Duration::seconds(MAX_TIMEOUT.as_secs() as i64)
        ));

        // Pausing again is a precondition violation, not a silent no-op.
        let err = handle.pause().await.unwrap_err();
        assert!(matches!(err, ManagerError::Conflict(_)));

        handle.resume(Duration::from_secs(300)).await.unwrap();
        let resumed = handle.current().await.unwrap();
        assert_eq!(resumed.status.state, SandboxState::Running);
        assert!(close_to(
            resumed.spec.pause_time.unwrap(),
            Utc::now() + chrono::Duration::seconds(300)
        ));
    }

    #[tokio::test]
    async fn resume_requires_paused() {
        let (_cache, handle) = handle_for("sb-1").await;
        let err = handle.resume(Duration::from_secs(60)).await.unwrap_err();
        assert!(matches!(err, ManagerError::Conflict(_)));
    }

    #[tokio::test]
    async fn kill_is_idempotent_while_terminating() {
        let backend: Arc<dyn ClusterBackend> = Arc::new(MemoryBackend::new());
        backend
            .create(ClusterObject::Sandbox(Sandbox::new("default", "sb-1", "base")))
            .await
            .unwrap();
        let cache = Cache::new(backend);
        cache.start().await.unwrap();
        let handle = SandboxHandle::new(
            "default--sb-1",
            cache,
            AgentClient::new(Duration::from_secs(5)).unwrap(),
            MAX_TIMEOUT,
        );

        handle.kill().await.unwrap();
        handle.kill().await.unwrap();

        let sandbox = handle.current().await.unwrap();
        assert!(sandbox.meta.deletion_timestamp.is_some());
    }

    #[tokio::test]
    async fn csi_mount_stores_the_annotation() {
        let (_cache, handle) = handle_for("sb-1").await;
        handle.csi_mount("s3.csi.aws.com", "ZW5jb2RlZA==").await.unwrap();
        let sandbox = handle.current().await.unwrap();
        assert_eq!(
            sandbox.meta.annotations.get(ANNOTATION_CSI_PUBLISH).unwrap(),
            "ZW5jb2RlZA=="
        );
    }

    #[tokio::test]
    async fn kill_of_missing_sandbox_is_not_found() {
        let (_cache, handle) = handle_for("sb-1").await;
        let missing = SandboxHandle::new(
            "default--nope",
            Arc::clone(&_cache),
            AgentClient::new(Duration::from_secs(5)).unwrap(),
            MAX_TIMEOUT,
        );
        let err = missing.kill().await.unwrap_err();
        assert!(matches!(err, ManagerError::NotFound(_)));
    }
}
