//! Counter storage contract shared by the in-memory and Redis backends.

use crate::error::SlowDownResult;
use async_trait::async_trait;
use std::time::Duration;

/// Minimal cache contract the slow-down counters rely on.
///
/// Values are signed: decrements past zero are allowed.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short backend name used in logs and health output.
    fn name(&self) -> &'static str;

    /// Return the stored value, inserting `default` with `ttl` if absent.
    async fn get_or_create(
        &self,
        key: &str,
        default: i64,
        ttl: Duration,
        tags: &[String],
    ) -> SlowDownResult<i64>;

    /// Upsert `value`, resetting the expiry to `ttl` from now.
    async fn set(&self, key: &str, value: i64, ttl: Duration, tags: &[String])
        -> SlowDownResult<()>;

    /// Drop `key`. `tags` are the tags it was written with.
    async fn remove(&self, key: &str, tags: &[String]) -> SlowDownResult<bool>;

    /// Evict every entry carrying any of `tags`. Returns the number of entries removed.
    async fn remove_by_tags(&self, tags: &[String]) -> SlowDownResult<usize>;

    /// Add `delta` to the value and return the result.
    ///
    /// The default is a plain read-modify-write: two concurrent callers on
    /// the same key can both read the same value and one increment is lost.
    /// Backends with a native atomic counter override this.
    async fn increment_and_get(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
        tags: &[String],
    ) -> SlowDownResult<i64> {
        let current = self.get_or_create(key, 0, ttl, tags).await?;
        let updated = current.saturating_add(delta);
        self.set(key, updated, ttl, tags).await?;
        Ok(updated)
    }

    /// Time left before `key` expires, or `None` if it is missing or the
    /// backend cannot tell.
    async fn time_to_live(&self, _key: &str) -> SlowDownResult<Option<Duration>> {
        Ok(None)
    }

    async fn ping(&self) -> SlowDownResult<()> {
        Ok(())
    }
}
