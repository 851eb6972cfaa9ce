//! Patch-retry helper shared by every sandbox writer.
//!
//! Fetches the latest copy from the backend, applies the caller's change to
//! a deep copy, writes it back and retries on resource-version conflicts.
//! On success the new version is recorded as an expectation so subsequent
//! cache reads can enforce read-your-writes.

use std::sync::Arc;

use tracing::debug;

use crate::backend::{ClusterBackend, ClusterError};
use crate::expectations::Expectations;
use crate::object::{ClusterObject, Kind, Sandbox, Secret};

const MAX_PATCH_ATTEMPTS: usize = 3;

/// Applies `apply` to the latest copy of the sandbox and writes it back.
/// Returns the updated sandbox together with its new resource version.
pub async fn mutate_sandbox<F>(
    backend: &Arc<dyn ClusterBackend>,
    expectations: &Expectations,
    key: &str,
    mut apply: F,
) -> Result<(Sandbox, String), ClusterError>
where
    F: FnMut(&mut Sandbox) -> Result<(), ClusterError>,
{
    let mut last_conflict = None;
    for attempt in 0..MAX_PATCH_ATTEMPTS {
        let current = backend
            .get(Kind::Sandbox, key)
            .await?
            .and_then(ClusterObject::into_sandbox)
            .ok_or_else(|| ClusterError::NotFound(Kind::Sandbox, key.to_string()))?;

        let mut updated = current.clone();
        apply(&mut updated)?;

        match backend.update(ClusterObject::Sandbox(updated)).await {
            Ok(rv) => {
                expectations.expect(key, &rv);
                let confirmed = backend
                    .get(Kind::Sandbox, key)
                    .await?
                    .and_then(ClusterObject::into_sandbox)
                    .ok_or_else(|| ClusterError::NotFound(Kind::Sandbox, key.to_string()))?;
                return Ok((confirmed, rv));
            }
            Err(ClusterError::Conflict(conflicted)) => {
                debug!(key = %key, attempt, "patch conflict, refetching");
                last_conflict = Some(ClusterError::Conflict(conflicted));
            }
            Err(other) => return Err(other),
        }
    }
    Err(last_conflict.unwrap_or_else(|| ClusterError::Conflict(key.to_string())))
}

/// Same retry discipline for the key-store secret.
pub async fn mutate_secret<F>(
    backend: &Arc<dyn ClusterBackend>,
    key: &str,
    mut apply: F,
) -> Result<(Secret, String), ClusterError>
where
    F: FnMut(&mut Secret) -> Result<(), ClusterError>,
{
    let mut last_conflict = None;
    for attempt in 0..MAX_PATCH_ATTEMPTS {
        let current = match backend.get(Kind::Secret, key).await? {
            Some(ClusterObject::Secret(secret)) => secret,
            _ => return Err(ClusterError::NotFound(Kind::Secret, key.to_string())),
        };

        let mut updated = current.clone();
        apply(&mut updated)?;

        match backend.update(ClusterObject::Secret(updated.clone())).await {
            Ok(rv) => return Ok((updated, rv)),
            Err(ClusterError::Conflict(conflicted)) => {
                debug!(key = %key, attempt, "secret patch conflict, refetching");
                last_conflict = Some(ClusterError::Conflict(conflicted));
            }
            Err(other) => return Err(other),
        }
    }
    Err(last_conflict.unwrap_or_else(|| ClusterError::Conflict(key.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    #[tokio::test]
    async fn mutation_records_expectation() {
        let backend: Arc<dyn ClusterBackend> = Arc::new(MemoryBackend::new());
        let expectations = Expectations::new();
        backend
            .create(ClusterObject::Sandbox(Sandbox::new("default", "sb-1", "base")))
            .await
            .unwrap();

        let (updated, rv) = mutate_sandbox(&backend, &expectations, "default--sb-1", |s| {
            s.set_owner("user-1");
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(updated.owner(), "user-1");
        assert!(expectations.satisfied("default--sb-1", &rv));
        assert!(!expectations.satisfied("default--sb-1", "0"));
    }

    #[tokio::test]
    async fn missing_sandbox_is_not_found() {
        let backend: Arc<dyn ClusterBackend> = Arc::new(MemoryBackend::new());
        let expectations = Expectations::new();
        let err = mutate_sandbox(&backend, &expectations, "default--missing", |_| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(Kind::Sandbox, _)));
    }

    #[tokio::test]
    async fn concurrent_mutations_converge() {
        let backend: Arc<dyn ClusterBackend> = Arc::new(MemoryBackend::new());
        let expectations = Arc::new(Expectations::new());
        backend
            .create(ClusterObject::Sandbox(Sandbox::new("default", "sb-1", "base")))
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for i in 0..3 {
            let backend = Arc::clone(&backend);
            let expectations = Arc::clone(&expectations);
            tasks.push(tokio::spawn(async move {
                mutate_sandbox(&backend, &expectations, "default--sb-1", |s| {
                    s.meta
                        .annotations
                        .insert(format!("agents.kruise.io/writer-{i}"), "done".into());
                    Ok(())
                })
                .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let sandbox = backend
            .get(Kind::Sandbox, "default--sb-1")
            .await
            .unwrap()
            .unwrap()
            .into_sandbox()
            .unwrap();
        for i in 0..3 {
            assert!(sandbox
                .meta
                .annotations
                .contains_key(&format!("agents.kruise.io/writer-{i}")));
        }
    }
}
