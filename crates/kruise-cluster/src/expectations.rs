//! Read-your-writes discipline over the eventually consistent mirror.
//!
//! After a successful patch returning resource version `v`, the writer
//! records `Expect(key, v)`. Readers that need to see their own write call
//! [`Expectations::satisfied`] against the cached copy, or park in
//! [`Expectations::wait_satisfied`] with bounded backoff.

use std::time::Duration;

use dashmap::DashMap;
use thiserror::Error;

use crate::cache::Cache;
use crate::object::{rv_value, Kind};

/// Surfaced when the cache has not yet caught up with a local write.
/// Callers retry or report it as a transient condition, never as corruption.
#[derive(Debug, Error)]
#[error("cache has not observed resource version {expected} for {key} yet")]
pub struct TransientNotReady {
    pub key: String,
    pub expected: u64,
}

#[derive(Default)]
pub struct Expectations {
    expected: DashMap<String, u64>,
}

impl Expectations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the cache must eventually show `rv` for `key`. A smaller
    /// version than the current expectation is a no-op.
    pub fn expect(&self, key: &str, rv: &str) {
        let value = rv_value(rv);
        let mut entry = self.expected.entry(key.to_string()).or_insert(0);
        if value > *entry {
            *entry = value;
        }
    }

    /// True iff no expectation is set or the provided cached version has
    /// caught up.
    pub fn satisfied(&self, key: &str, cached_rv: &str) -> bool {
        match self.expected.get(key) {
            Some(entry) => rv_value(cached_rv) >= *entry,
            None => true,
        }
    }

    pub fn clear(&self, key: &str) {
        self.expected.remove(key);
    }

    fn pending(&self, key: &str) -> Option<u64> {
        self.expected.get(key).map(|entry| *entry)
    }

    /// Polls the cache with backoff until the expectation for `key` is met.
    pub async fn wait_satisfied(
        &self,
        cache: &Cache,
        kind: Kind,
        key: &str,
        timeout: Duration,
    ) -> Result<(), TransientNotReady> {
        let deadline = tokio::time::Instant::now() + timeout;
        let mut backoff = Duration::from_millis(5);
        loop {
            let cached_rv = cache
                .get(kind, key)
                .map(|object| object.meta().resource_version.clone())
                .unwrap_or_default();
            if self.satisfied(key, &cached_rv) {
                return Ok(());
            }
            if tokio::time::Instant::now() + backoff > deadline {
                return Err(TransientNotReady {
                    key: key.to_string(),
                    expected: self.pending(key).unwrap_or(0),
                });
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(Duration::from_millis(200));
        }
    }
}
