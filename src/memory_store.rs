use crate::error::SlowDownResult;
use crate::store::CounterStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Entry {
    value: i64,
    expires_at: Instant,
    tags: Vec<String>,
}

impl Entry {
    fn new(value: i64, ttl: Duration, tags: &[String]) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
            tags: tags.to_vec(),
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Process-local counter store with per-entry expiry.
///
/// Expired entries are dropped lazily on access; `purge_expired` sweeps the
/// rest.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove all expired entries, returning how many were dropped.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        let initial_count = entries.len();
        entries.retain(|_, entry| entry.is_live(now));
        initial_count - entries.len()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|entry| entry.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get_or_create(
        &self,
        key: &str,
        default: i64,
        ttl: Duration,
        tags: &[String],
    ) -> SlowDownResult<i64> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(entry.value),
            _ => {
                entries.insert(key.to_string(), Entry::new(default, ttl, tags));
                Ok(default)
            }
        }
    }

    async fn set(
        &self,
        key: &str,
        value: i64,
        ttl: Duration,
        tags: &[String],
    ) -> SlowDownResult<()> {
        let mut entries = self.entries.write().await;
        entries.insert(key.to_string(), Entry::new(value, ttl, tags));
        Ok(())
    }

    async fn remove(&self, key: &str, _tags: &[String]) -> SlowDownResult<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        Ok(entries
            .remove(key)
            .is_some_and(|entry| entry.is_live(now)))
    }

    async fn remove_by_tags(&self, tags: &[String]) -> SlowDownResult<usize> {
        let mut entries = self.entries.write().await;
        let initial_count = entries.len();
        entries.retain(|_, entry| !entry.tags.iter().any(|tag| tags.contains(tag)));
        Ok(initial_count - entries.len())
    }

    async fn increment_and_get(
        &self,
        key: &str,
        delta: i64,
        ttl: Duration,
        tags: &[String],
    ) -> SlowDownResult<i64> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;

        let current = entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map_or(0, |entry| entry.value);
        let updated = current.saturating_add(delta);
        entries.insert(key.to_string(), Entry::new(updated, ttl, tags));
        Ok(updated)
    }

    async fn time_to_live(&self, key: &str) -> SlowDownResult<Option<Duration>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.expires_at - now))
    }
}
