//! Counter cache used by the slow-down middleware.
//!
//! Wraps a [`CounterStore`] so that every call is bounded by the configured
//! cache timeout. Plain reads fall back to zero and plain writes are dropped;
//! count updates report their failure to the caller. Counts live under
//! `{key}_count`; the window start lives under `{key}_timestamp`, is written
//! once per window, and its expiry bounds the count's.

use crate::delay::duration_millis;
use crate::error::{SlowDownError, SlowDownResult};
use crate::options::SlowDownConfig;
use crate::store::CounterStore;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

#[derive(Clone)]
pub struct CounterCache {
    store: Arc<dyn CounterStore>,
}

pub fn count_key(key: &str) -> String {
    format!("{}_count", key)
}

pub fn timestamp_key(key: &str) -> String {
    format!("{}_timestamp", key)
}

impl CounterCache {
    pub fn new(store: Arc<dyn CounterStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Current count for `key`, creating a zero entry if there is none.
    pub async fn get(&self, key: &str, config: &SlowDownConfig) -> i64 {
        let result = bounded(
            config.cache_timeout,
            self.store
                .get_or_create(&count_key(key), 0, config.window, &config.cache_tags),
        )
        .await;

        result.unwrap_or_else(|err| {
            warn!(target: "slow_down::cache", key = %key, error = %err, "Count read failed, assuming 0");
            0
        })
    }

    /// Overwrite the count for `key` within the current window.
    pub async fn set(&self, key: &str, count: i64, config: &SlowDownConfig) {
        let ttl = self.window_ttl(key, config).await;
        let result = bounded(
            config.cache_timeout,
            self.store
                .set(&count_key(key), count, ttl, &config.cache_tags),
        )
        .await;

        if let Err(err) = result {
            warn!(target: "slow_down::cache", key = %key, count, error = %err, "Count write dropped");
        }
    }

    /// Add `delta` to the count for `key` and return the new count.
    ///
    /// Unlike the plain reads, a failure here is returned: without a real
    /// count there is nothing to decide or report.
    pub async fn change_count(
        &self,
        key: &str,
        delta: i64,
        config: &SlowDownConfig,
    ) -> SlowDownResult<i64> {
        let ttl = self.window_ttl(key, config).await;
        bounded(
            config.cache_timeout,
            self.store
                .increment_and_get(&count_key(key), delta, ttl, &config.cache_tags),
        )
        .await
    }

    /// Unix milliseconds at which the current window for `key` started.
    pub async fn window_started_at(&self, key: &str, config: &SlowDownConfig) -> Option<i64> {
        let now = unix_millis();
        let result = bounded(
            config.cache_timeout,
            self.store
                .get_or_create(&timestamp_key(key), now, config.window, &config.cache_tags),
        )
        .await;

        match result {
            Ok(started) => Some(started),
            Err(err) => {
                warn!(target: "slow_down::cache", key = %key, error = %err, "Window timestamp unavailable");
                None
            }
        }
    }

    /// Expiry for a count write: the remaining life of the window's
    /// timestamp entry, so the two expire together.
    async fn window_ttl(&self, key: &str, config: &SlowDownConfig) -> Duration {
        if self.window_started_at(key, config).await.is_none() {
            return config.window;
        }

        let result = bounded(
            config.cache_timeout,
            self.store.time_to_live(&timestamp_key(key)),
        )
        .await;

        match result {
            Ok(Some(ttl)) if !ttl.is_zero() => ttl,
            Ok(_) => config.window,
            Err(err) => {
                warn!(target: "slow_down::cache", key = %key, error = %err, "Window expiry unavailable");
                config.window
            }
        }
    }

    /// Drop the count and window for `key`.
    pub async fn remove(&self, key: &str, config: &SlowDownConfig) -> SlowDownResult<bool> {
        let timeout = config.cache_timeout;
        let tags = &config.cache_tags;
        let removed = bounded(timeout, self.store.remove(&count_key(key), tags)).await?;
        bounded(timeout, self.store.remove(&timestamp_key(key), tags)).await?;
        Ok(removed)
    }

    pub async fn remove_by_tags(&self, tags: &[String], timeout: Duration) -> SlowDownResult<usize> {
        bounded(timeout, self.store.remove_by_tags(tags)).await
    }
}

/// Run a store call, giving up once `timeout` elapses.
async fn bounded<T, F>(timeout: Duration, call: F) -> SlowDownResult<T>
where
    F: Future<Output = SlowDownResult<T>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| SlowDownError::StoreTimeout(duration_millis(timeout)))?
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or_default()
}
