use serde::Serialize;
use std::time::{SystemTime, UNIX_EPOCH};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: u64,
    pub version: String,
    pub store: String,
    pub store_connected: bool,
}

impl HealthResponse {
    pub fn healthy(store: &str) -> Self {
        Self {
            status: "healthy".to_string(),
            timestamp: now_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            store: store.to_string(),
            store_connected: true,
        }
    }

    /// Requests are still served, just without slow-down accounting.
    pub fn degraded(store: &str) -> Self {
        Self {
            status: "degraded".to_string(),
            timestamp: now_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            store: store.to_string(),
            store_connected: false,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CounterResponse {
    pub key: String,
    pub count: i64,
    pub limit: u32,
    pub remaining: u64,
}

#[derive(Debug, Serialize)]
pub struct RemovedResponse {
    pub status: String,
    pub removed: usize,
}

impl RemovedResponse {
    pub fn new(removed: usize) -> Self {
        Self {
            status: "success".to_string(),
            removed,
        }
    }
}
