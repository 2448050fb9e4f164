//! Progressive slow-down of clients that exceed their allowance.
//!
//! Every request is counted against its client key. Once the count for the
//! current window passes the threshold, the request is held back for a delay
//! that grows with each further request. Requests are never rejected: every
//! failure inside the slow-down logic is logged and the request is forwarded
//! as if the middleware were absent.

use crate::cache::CounterCache;
use crate::delay::ThrottleDecision;
use crate::error::{SlowDownError, SlowDownResult};
use crate::key_resolver::RequestInfo;
use crate::options::SlowDownConfig;
use crate::store::CounterStore;
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderValue};
use axum::response::Response;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, info};

pub const LIMIT_HEADER: &str = "x-slow-down-limit";
pub const REMAINING_HEADER: &str = "x-slow-down-remaining";
pub const DELAY_HEADER: &str = "x-slow-down-delay";

#[derive(Clone)]
pub struct SlowDown {
    config: Arc<RwLock<Arc<SlowDownConfig>>>,
    cache: CounterCache,
}

/// Per-request state carried from before the handler runs to after it returns.
#[derive(Debug)]
struct Throttled {
    key: String,
    decision: ThrottleDecision,
}

impl SlowDown {
    pub fn new(config: SlowDownConfig, store: Arc<dyn CounterStore>) -> Self {
        Self {
            config: Arc::new(RwLock::new(Arc::new(config))),
            cache: CounterCache::new(store),
        }
    }

    /// Snapshot of the active configuration.
    pub async fn config(&self) -> Arc<SlowDownConfig> {
        self.config.read().await.clone()
    }

    /// Replace the configuration. Requests already in flight keep their snapshot.
    pub async fn update_config(&self, new_config: SlowDownConfig) {
        let mut config = self.config.write().await;
        *config = Arc::new(new_config);
    }

    pub fn cache(&self) -> &CounterCache {
        &self.cache
    }

    /// Count, delay and forward one request, then settle skip rules on the
    /// response. `next` is always called exactly once.
    pub async fn run<F, Fut>(&self, request: Request, next: F) -> Response
    where
        F: FnOnce(Request) -> Fut,
        Fut: Future<Output = Response>,
    {
        let config = self.config().await;
        if !config.enabled {
            return next(request).await;
        }

        let info = RequestInfo::from_request(&request);
        let throttled = match self.slow_down(&config, &info).await {
            Ok(throttled) => Some(throttled),
            Err(err) => {
                error!(
                    target: "slow_down::middleware",
                    uri = %info.uri,
                    error = %err,
                    "An error occurred while processing request"
                );
                None
            }
        };

        let mut response = next(request).await;

        if let Some(throttled) = throttled {
            if config.add_headers {
                apply_headers(
                    response.headers_mut(),
                    throttled.decision.delay_ms(),
                    config.threshold,
                    throttled.decision.remaining,
                );
            }

            if let Err(err) = self
                .settle_skip(&config, &info, &throttled.key, &mut response)
                .await
            {
                error!(
                    target: "slow_down::middleware",
                    key = %throttled.key,
                    error = %err,
                    "An error occurred while applying skip rules"
                );
            }
        }

        response
    }

    async fn slow_down(
        &self,
        config: &SlowDownConfig,
        info: &RequestInfo,
    ) -> SlowDownResult<Throttled> {
        let key = guarded("key generator", || config.key_generator.generate_key(info))??;

        let count = self.cache.change_count(&key, 1, config).await?;
        let decision = ThrottleDecision::new(count, config);

        debug!(
            target: "slow_down::middleware",
            key = %key,
            count = decision.count,
            remaining = decision.remaining,
            delay_ms = decision.delay_ms(),
            "Slow-down decision"
        );

        if !decision.delay.is_zero() {
            info!(
                target: "slow_down::middleware",
                key = %key,
                count = decision.count,
                delay_ms = decision.delay_ms(),
                "Limit reached, delaying request"
            );

            if let Some(on_limit_reached) = &config.on_limit_reached {
                if let Err(err) = guarded("limit reached callback", || on_limit_reached(info)) {
                    error!(target: "slow_down::middleware", key = %key, error = %err, "Limit reached callback failed");
                }
            }

            if !config.fake_delay {
                tokio::time::sleep(decision.delay).await;
            }
        }

        Ok(Throttled { key, decision })
    }

    /// Undo the count for responses that should not count and adjust the
    /// headers to match.
    ///
    /// The adjusted headers keep the delay already reported and add one to
    /// the reported remaining count, rather than recomputing both from the
    /// decremented count.
    async fn settle_skip(
        &self,
        config: &SlowDownConfig,
        info: &RequestInfo,
        key: &str,
        response: &mut Response,
    ) -> SlowDownResult<()> {
        let failed = response.status().as_u16() >= 400;
        let skip_requested = match &config.skip {
            Some(skip) => guarded("skip predicate", || skip(info))?,
            None => false,
        };

        let should_skip = (config.skip_failed && failed)
            || (config.skip_successful && !failed)
            || skip_requested;
        if !should_skip {
            return Ok(());
        }

        let count = self.cache.change_count(key, -1, config).await?;
        debug!(target: "slow_down::middleware", key = %key, count, "Request skipped, count restored");

        if config.add_headers {
            let headers = response.headers_mut();
            let delay_ms = read_header(headers, DELAY_HEADER)?;
            let remaining = read_header(headers, REMAINING_HEADER)?;
            apply_headers(
                headers,
                delay_ms,
                config.threshold,
                remaining.saturating_add(1),
            );
        }

        Ok(())
    }
}

fn apply_headers(headers: &mut HeaderMap, delay_ms: u64, limit: u32, remaining: u64) {
    headers.insert(DELAY_HEADER, HeaderValue::from(delay_ms));
    headers.insert(LIMIT_HEADER, HeaderValue::from(limit));
    headers.insert(REMAINING_HEADER, HeaderValue::from(remaining));
}

fn read_header(headers: &HeaderMap, name: &str) -> SlowDownResult<u64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| SlowDownError::Internal(format!("missing or malformed {} header", name)))
}

/// Run a user-supplied strategy, turning a panic into an error.
fn guarded<T>(what: &str, f: impl FnOnce() -> T) -> SlowDownResult<T> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .map_err(|_| SlowDownError::Internal(format!("{} panicked", what)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::StatusCode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Store that only counts how often it is touched.
    #[derive(Default)]
    struct CountingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CounterStore for CountingStore {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn get_or_create(&self, _: &str, default: i64, _: Duration, _: &[String]) -> SlowDownResult<i64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(default)
        }

        async fn set(&self, _: &str, _: i64, _: Duration, _: &[String]) -> SlowDownResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn remove(&self, _: &str, _: &[String]) -> SlowDownResult<bool> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(false)
        }

        async fn remove_by_tags(&self, _: &[String]) -> SlowDownResult<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(0)
        }
    }

    /// Store whose backend is unreachable.
    struct DownStore;

    #[async_trait]
    impl CounterStore for DownStore {
        fn name(&self) -> &'static str {
            "down"
        }

        async fn get_or_create(&self, _: &str, _: i64, _: Duration, _: &[String]) -> SlowDownResult<i64> {
            Err(SlowDownError::StoreUnavailable("connection refused".to_string()))
        }

        async fn set(&self, _: &str, _: i64, _: Duration, _: &[String]) -> SlowDownResult<()> {
            Err(SlowDownError::StoreUnavailable("connection refused".to_string()))
        }

        async fn remove(&self, _: &str, _: &[String]) -> SlowDownResult<bool> {
            Err(SlowDownError::StoreUnavailable("connection refused".to_string()))
        }

        async fn remove_by_tags(&self, _: &[String]) -> SlowDownResult<usize> {
            Err(SlowDownError::StoreUnavailable("connection refused".to_string()))
        }
    }

    fn request_from(ip: &'static str) -> Request {
        let mut request = Request::new(Body::empty());
        request
            .headers_mut()
            .insert("x-forwarded-for", HeaderValue::from_static(ip));
        request
    }

    async fn ok(_: Request) -> Response {
        Response::new(Body::empty())
    }

    async fn server_error(_: Request) -> Response {
        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        response
    }

    fn header(response: &Response, name: &str) -> Option<String> {
        response
            .headers()
            .get(name)
            .map(|value| value.to_str().unwrap().to_string())
    }

    fn fake_delay_config() -> SlowDownConfig {
        SlowDownConfig::default().with_fake_delay(true)
    }

    #[tokio::test]
    async fn test_disabled_touches_nothing() {
        let store = Arc::new(CountingStore::default());
        let config = SlowDownConfig {
            enabled: false,
            ..Default::default()
        };
        let slow_down = SlowDown::new(config, store.clone());

        let response = slow_down.run(request_from("4.2.2.4"), ok).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(DELAY_HEADER).is_none());
        assert!(response.headers().get(LIMIT_HEADER).is_none());
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_threshold_crossing_delays_by_one_unit() {
        let store = Arc::new(MemoryStore::new());
        let config = SlowDownConfig {
            threshold: 10,
            ..fake_delay_config()
        };
        let slow_down = SlowDown::new(config.clone(), store);
        slow_down.cache().set("4.2.2.4", 10, &config).await;

        let response = slow_down.run(request_from("4.2.2.4"), ok).await;

        assert_eq!(slow_down.cache().get("4.2.2.4", &config).await, 11);
        assert_eq!(header(&response, LIMIT_HEADER).as_deref(), Some("10"));
        assert_eq!(header(&response, REMAINING_HEADER).as_deref(), Some("0"));
        assert_eq!(header(&response, DELAY_HEADER).as_deref(), Some("1000"));
    }

    #[tokio::test]
    async fn test_below_threshold_reports_remaining() {
        let store = Arc::new(MemoryStore::new());
        let config = SlowDownConfig {
            threshold: 50,
            ..fake_delay_config()
        };
        let slow_down = SlowDown::new(config.clone(), store);
        slow_down.cache().set("4.2.2.4", 10, &config).await;

        let response = slow_down.run(request_from("4.2.2.4"), ok).await;

        assert_eq!(slow_down.cache().get("4.2.2.4", &config).await, 11);
        assert_eq!(header(&response, REMAINING_HEADER).as_deref(), Some("39"));
        assert_eq!(header(&response, DELAY_HEADER).as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_large_excess_is_uncapped_by_default() {
        let store = Arc::new(MemoryStore::new());
        let config = SlowDownConfig {
            threshold: 100,
            unit_delay: Duration::from_millis(50),
            ..fake_delay_config()
        };
        let slow_down = SlowDown::new(config.clone(), store);
        slow_down.cache().set("4.2.2.4", 300, &config).await;

        let response = slow_down.run(request_from("4.2.2.4"), ok).await;

        assert_eq!(header(&response, DELAY_HEADER).as_deref(), Some("10050"));
    }

    #[tokio::test]
    async fn test_unresolvable_client_is_forwarded_untouched() {
        let store = Arc::new(CountingStore::default());
        let slow_down = SlowDown::new(SlowDownConfig::default(), store.clone());

        let response = slow_down.run(Request::new(Body::empty()), ok).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(DELAY_HEADER).is_none());
        assert!(response.headers().get(REMAINING_HEADER).is_none());
        assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_store_outage_forwards_without_headers() {
        let slow_down = SlowDown::new(SlowDownConfig::default(), Arc::new(DownStore));

        for _ in 0..20 {
            let response = slow_down.run(request_from("4.2.2.4"), ok).await;

            assert_eq!(response.status(), StatusCode::OK);
            for name in [LIMIT_HEADER, REMAINING_HEADER, DELAY_HEADER] {
                assert!(response.headers().get(name).is_none(), "{} present", name);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_client_does_not_hold_up_others() {
        let config = SlowDownConfig {
            threshold: 1,
            unit_delay: Duration::from_millis(1000),
            ..Default::default()
        };
        let slow_down = SlowDown::new(config, Arc::new(MemoryStore::new()));
        slow_down.run(request_from("1.1.1.1"), ok).await;

        let started = tokio::time::Instant::now();
        let delayed = tokio::spawn({
            let slow_down = slow_down.clone();
            async move { slow_down.run(request_from("1.1.1.1"), ok).await }
        });
        tokio::task::yield_now().await;

        let response = slow_down.run(request_from("2.2.2.2"), ok).await;
        assert!(started.elapsed() < Duration::from_millis(1));
        assert_eq!(header(&response, DELAY_HEADER).as_deref(), Some("0"));
        assert!(!delayed.is_finished());

        let response = delayed.await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(1000));
        assert_eq!(header(&response, DELAY_HEADER).as_deref(), Some("1000"));
    }

    #[tokio::test]
    async fn test_panicking_key_generator_fails_open() {
        let config = SlowDownConfig::default().with_key_generator(
            |_: &RequestInfo| -> SlowDownResult<String> { panic!("boom") },
        );
        let slow_down = SlowDown::new(config, Arc::new(MemoryStore::new()));

        let response = slow_down.run(request_from("4.2.2.4"), ok).await;

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get(DELAY_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_no_headers_when_disabled_in_config() {
        let config = SlowDownConfig {
            add_headers: false,
            ..fake_delay_config()
        };
        let slow_down = SlowDown::new(config, Arc::new(MemoryStore::new()));

        let response = slow_down.run(request_from("4.2.2.4"), ok).await;

        assert!(response.headers().get(DELAY_HEADER).is_none());
        assert!(response.headers().get(LIMIT_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_skip_predicate_restores_count() {
        let config = fake_delay_config().with_skip(|info| info.uri.path() == "/");
        let slow_down = SlowDown::new(config.clone(), Arc::new(MemoryStore::new()));
        slow_down.cache().set("4.2.2.4", 3, &config).await;

        let response = slow_down.run(request_from("4.2.2.4"), ok).await;

        assert_eq!(slow_down.cache().get("4.2.2.4", &config).await, 3);
        // remaining was 5 - 4 = 1 when the request went through
        assert_eq!(header(&response, REMAINING_HEADER).as_deref(), Some("2"));
        assert_eq!(header(&response, DELAY_HEADER).as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_skip_failed_requests() {
        let config = SlowDownConfig {
            skip_failed: true,
            ..fake_delay_config()
        };
        let slow_down = SlowDown::new(config.clone(), Arc::new(MemoryStore::new()));

        slow_down.run(request_from("4.2.2.4"), server_error).await;
        assert_eq!(slow_down.cache().get("4.2.2.4", &config).await, 0);

        slow_down.run(request_from("4.2.2.4"), ok).await;
        assert_eq!(slow_down.cache().get("4.2.2.4", &config).await, 1);
    }

    #[tokio::test]
    async fn test_skip_successful_requests() {
        let config = SlowDownConfig {
            skip_successful: true,
            ..fake_delay_config()
        };
        let slow_down = SlowDown::new(config.clone(), Arc::new(MemoryStore::new()));

        slow_down.run(request_from("4.2.2.4"), ok).await;
        assert_eq!(slow_down.cache().get("4.2.2.4", &config).await, 0);

        slow_down.run(request_from("4.2.2.4"), server_error).await;
        assert_eq!(slow_down.cache().get("4.2.2.4", &config).await, 1);
    }

    #[tokio::test]
    async fn test_skip_keeps_reported_delay() {
        let config = SlowDownConfig {
            threshold: 1,
            skip_failed: true,
            ..fake_delay_config()
        };
        let slow_down = SlowDown::new(config.clone(), Arc::new(MemoryStore::new()));
        slow_down.cache().set("4.2.2.4", 3, &config).await;

        let response = slow_down.run(request_from("4.2.2.4"), server_error).await;

        assert_eq!(slow_down.cache().get("4.2.2.4", &config).await, 3);
        assert_eq!(header(&response, DELAY_HEADER).as_deref(), Some("3000"));
        assert_eq!(header(&response, REMAINING_HEADER).as_deref(), Some("1"));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_limit_reached_callback_runs_once_per_delayed_request() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let config = SlowDownConfig {
            threshold: 2,
            ..fake_delay_config()
        }
        .with_on_limit_reached(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let slow_down = SlowDown::new(config, Arc::new(MemoryStore::new()));

        for _ in 0..4 {
            slow_down.run(request_from("4.2.2.4"), ok).await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delay_suspends_request() {
        let config = SlowDownConfig {
            threshold: 1,
            unit_delay: Duration::from_millis(500),
            ..Default::default()
        };
        let slow_down = SlowDown::new(config, Arc::new(MemoryStore::new()));

        slow_down.run(request_from("4.2.2.4"), ok).await;

        let started = tokio::time::Instant::now();
        slow_down.run(request_from("4.2.2.4"), ok).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(500) && elapsed < Duration::from_millis(1000));

        let started = tokio::time::Instant::now();
        slow_down.run(request_from("4.2.2.4"), ok).await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1000) && elapsed < Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fake_delay_does_not_suspend() {
        let config = SlowDownConfig {
            threshold: 1,
            ..fake_delay_config()
        };
        let slow_down = SlowDown::new(config, Arc::new(MemoryStore::new()));

        let started = tokio::time::Instant::now();
        for _ in 0..5 {
            slow_down.run(request_from("4.2.2.4"), ok).await;
        }
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_clients_are_counted_separately() {
        let config = fake_delay_config();
        let slow_down = SlowDown::new(config.clone(), Arc::new(MemoryStore::new()));

        slow_down.run(request_from("1.1.1.1"), ok).await;
        slow_down.run(request_from("1.1.1.1"), ok).await;
        slow_down.run(request_from("2.2.2.2"), ok).await;

        assert_eq!(slow_down.cache().get("1.1.1.1", &config).await, 2);
        assert_eq!(slow_down.cache().get("2.2.2.2", &config).await, 1);
    }

    #[tokio::test]
    async fn test_update_config_replaces_snapshot() {
        let slow_down = SlowDown::new(fake_delay_config(), Arc::new(MemoryStore::new()));
        slow_down
            .update_config(SlowDownConfig {
                threshold: 42,
                ..fake_delay_config()
            })
            .await;

        let response = slow_down.run(request_from("4.2.2.4"), ok).await;
        assert_eq!(slow_down.config().await.threshold, 42);
        assert_eq!(header(&response, LIMIT_HEADER).as_deref(), Some("42"));
        assert_eq!(header(&response, REMAINING_HEADER).as_deref(), Some("41"));
    }
}
