use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};

use crate::delay::remaining;
use crate::error::{SlowDownError, SlowDownResult};
use crate::response::{CounterResponse, HealthResponse, RemovedResponse};
use crate::slow_down::SlowDown;

fn validate_key(key: &str) -> SlowDownResult<()> {
    if key.trim().is_empty() {
        return Err(SlowDownError::Validation("Key cannot be empty".to_string()));
    }
    Ok(())
}

/// Demo endpoint behind the slow-down filter
pub async fn index() -> impl IntoResponse {
    Json(serde_json::json!({ "message": "Hello from behind the slow-down filter" }))
}

/// Demo endpoint that always fails, for exercising `SkipFailedRequests`
pub async fn fail() -> impl IntoResponse {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "message": "Something went wrong" })),
    )
}

/// Health check endpoint
pub async fn health_check(State(slow_down): State<SlowDown>) -> impl IntoResponse {
    let config = slow_down.config().await;
    let store = slow_down.cache().store();

    let reachable = tokio::time::timeout(config.cache_timeout, store.ping())
        .await
        .map(|result| result.is_ok())
        .unwrap_or(false);

    if reachable {
        Json(HealthResponse::healthy(store.name()))
    } else {
        Json(HealthResponse::degraded(store.name()))
    }
}

/// Current count for a client key
pub async fn get_counter(
    State(slow_down): State<SlowDown>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, SlowDownError> {
    validate_key(&key)?;

    let config = slow_down.config().await;
    let count = slow_down.cache().get(&key, &config).await;

    Ok(Json(CounterResponse {
        remaining: remaining(count, config.threshold),
        limit: config.threshold,
        count,
        key,
    }))
}

/// Forget a client key
pub async fn delete_counter(
    State(slow_down): State<SlowDown>,
    Path(key): Path<String>,
) -> Result<impl IntoResponse, SlowDownError> {
    validate_key(&key)?;

    let config = slow_down.config().await;
    let removed = slow_down.cache().remove(&key, &config).await?;

    Ok(Json(RemovedResponse::new(usize::from(removed))))
}

/// Forget every counter carrying a cache tag
pub async fn delete_tag(
    State(slow_down): State<SlowDown>,
    Path(tag): Path<String>,
) -> Result<impl IntoResponse, SlowDownError> {
    validate_key(&tag)?;

    let config = slow_down.config().await;
    let removed = slow_down
        .cache()
        .remove_by_tags(&[tag], config.cache_timeout)
        .await?;

    Ok(Json(RemovedResponse::new(removed)))
}
