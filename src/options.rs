use crate::error::{SlowDownError, SlowDownResult};
use crate::key_resolver::{ClientIpKeyGenerator, KeyGenerator, RequestInfo};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Name of the configuration section holding the slow-down settings.
pub const CONFIGURATION_KEY: &str = "SlowDown";

pub type SkipFn = Arc<dyn Fn(&RequestInfo) -> bool + Send + Sync>;
pub type LimitReachedFn = Arc<dyn Fn(&RequestInfo) + Send + Sync>;

/// Bindable slow-down settings. Durations are in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "PascalCase", default)]
pub struct SlowDownOptions {
    pub slow_down_enabled: bool,
    /// Delay added per request over the threshold. `0` disables delaying.
    pub delay: u64,
    /// Requests allowed within the window before delaying starts. `0` disables delaying.
    pub delay_after: u32,
    /// Upper bound on the computed delay. `0` disables delaying.
    pub max_delay: u64,
    /// How long request counts are kept. `0` disables delaying.
    pub time_window: u64,
    pub add_headers: bool,
    pub skip_failed_requests: bool,
    pub skip_successful_requests: bool,
    #[validate(range(min = 1))]
    pub cache_timeout: u64,
    #[validate(custom(function = "validate_tags"))]
    pub cache_tags: Vec<String>,
}

impl Default for SlowDownOptions {
    fn default() -> Self {
        Self {
            slow_down_enabled: true,
            delay: 1000,
            delay_after: 5,
            max_delay: i32::MAX as u64,
            time_window: 30_000,
            add_headers: true,
            skip_failed_requests: false,
            skip_successful_requests: false,
            cache_timeout: 1000,
            cache_tags: vec!["slow-down".to_string()],
        }
    }
}

#[allow(clippy::ptr_arg)]
fn validate_tags(tags: &Vec<String>) -> Result<(), ValidationError> {
    if tags.iter().any(|tag| tag.trim().is_empty()) {
        return Err(ValidationError::new("empty_cache_tag"));
    }
    Ok(())
}

impl SlowDownOptions {
    /// Parse a JSON document, either the bare section or one wrapping it
    /// under `"SlowDown"`.
    pub fn from_json_str(json: &str) -> SlowDownResult<Self> {
        let mut document: serde_json::Value = serde_json::from_str(json)?;
        let section = match document.get_mut(CONFIGURATION_KEY) {
            Some(section) => section.take(),
            None => document,
        };
        let options: SlowDownOptions = serde_json::from_value(section)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> SlowDownResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SlowDownError::Configuration(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&contents)
    }

    /// Validate and convert into the runtime configuration.
    pub fn into_config(self) -> SlowDownResult<SlowDownConfig> {
        self.validate()?;

        Ok(SlowDownConfig {
            enabled: self.slow_down_enabled,
            unit_delay: Duration::from_millis(self.delay),
            threshold: self.delay_after,
            max_delay: Duration::from_millis(self.max_delay),
            window: Duration::from_millis(self.time_window),
            add_headers: self.add_headers,
            skip_failed: self.skip_failed_requests,
            skip_successful: self.skip_successful_requests,
            skip: None,
            on_limit_reached: None,
            key_generator: Arc::new(ClientIpKeyGenerator),
            cache_timeout: Duration::from_millis(self.cache_timeout),
            cache_tags: self.cache_tags,
            fake_delay: false,
        })
    }
}

/// Runtime slow-down configuration.
///
/// Treated as immutable once handed to the middleware; reconfiguration
/// swaps the whole value.
#[derive(Clone)]
pub struct SlowDownConfig {
    pub enabled: bool,
    pub unit_delay: Duration,
    pub threshold: u32,
    pub max_delay: Duration,
    pub window: Duration,
    pub add_headers: bool,
    pub skip_failed: bool,
    pub skip_successful: bool,
    pub skip: Option<SkipFn>,
    /// Called once per delayed request, before the delay starts.
    pub on_limit_reached: Option<LimitReachedFn>,
    pub key_generator: Arc<dyn KeyGenerator>,
    pub cache_timeout: Duration,
    pub cache_tags: Vec<String>,
    /// Skip the actual sleep while keeping every other side effect. Test use only.
    pub fake_delay: bool,
}

impl Default for SlowDownConfig {
    fn default() -> Self {
        let options = SlowDownOptions::default();
        Self {
            enabled: options.slow_down_enabled,
            unit_delay: Duration::from_millis(options.delay),
            threshold: options.delay_after,
            max_delay: Duration::from_millis(options.max_delay),
            window: Duration::from_millis(options.time_window),
            add_headers: options.add_headers,
            skip_failed: options.skip_failed_requests,
            skip_successful: options.skip_successful_requests,
            skip: None,
            on_limit_reached: None,
            key_generator: Arc::new(ClientIpKeyGenerator),
            cache_timeout: Duration::from_millis(options.cache_timeout),
            cache_tags: options.cache_tags,
            fake_delay: false,
        }
    }
}

impl SlowDownConfig {
    pub fn with_key_generator(mut self, generator: impl KeyGenerator + 'static) -> Self {
        self.key_generator = Arc::new(generator);
        self
    }

    pub fn with_skip<F>(mut self, skip: F) -> Self
    where
        F: Fn(&RequestInfo) -> bool + Send + Sync + 'static,
    {
        self.skip = Some(Arc::new(skip));
        self
    }

    pub fn with_on_limit_reached<F>(mut self, callback: F) -> Self
    where
        F: Fn(&RequestInfo) + Send + Sync + 'static,
    {
        self.on_limit_reached = Some(Arc::new(callback));
        self
    }

    pub fn with_fake_delay(mut self, fake_delay: bool) -> Self {
        self.fake_delay = fake_delay;
        self
    }

    /// Whether any of the zero-means-off settings turns delaying off.
    pub fn delaying_disabled(&self) -> bool {
        self.threshold == 0
            || self.unit_delay.is_zero()
            || self.window.is_zero()
            || self.max_delay.is_zero()
    }
}

impl fmt::Debug for SlowDownConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlowDownConfig")
            .field("enabled", &self.enabled)
            .field("unit_delay", &self.unit_delay)
            .field("threshold", &self.threshold)
            .field("max_delay", &self.max_delay)
            .field("window", &self.window)
            .field("add_headers", &self.add_headers)
            .field("skip_failed", &self.skip_failed)
            .field("skip_successful", &self.skip_successful)
            .field("skip", &self.skip.is_some())
            .field("on_limit_reached", &self.on_limit_reached.is_some())
            .field("cache_timeout", &self.cache_timeout)
            .field("cache_tags", &self.cache_tags)
            .field("fake_delay", &self.fake_delay)
            .finish_non_exhaustive()
    }
}
