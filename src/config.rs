use crate::error::{SlowDownError, SlowDownResult};
use crate::options::SlowDownOptions;
use envconfig::Envconfig;
use std::net::SocketAddr;

#[derive(Debug, Envconfig, Clone)]
pub struct Config {
    /// Server bind address
    #[envconfig(from = "BIND_ADDR", default = "127.0.0.1:3000")]
    pub bind_addr: SocketAddr,

    /// Redis connection URL; the in-memory store is used when unset
    #[envconfig(from = "REDIS_URL")]
    pub redis_url: Option<String>,

    #[envconfig(from = "LOG_LEVEL", default = "info")]
    pub log_level: String,

    /// JSON file holding the `SlowDown` section
    #[envconfig(from = "SLOWDOWN_CONFIG")]
    pub slow_down_config: Option<String>,

    /// In-memory store cleanup interval in seconds
    #[envconfig(from = "CLEANUP_INTERVAL", default = "60")]
    pub cleanup_interval_secs: u64,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn redis_url(&self) -> Option<&str> {
        self.redis_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn validate(&self) -> SlowDownResult<()> {
        if let Some(url) = self.redis_url() {
            if !url.starts_with("redis://") && !url.starts_with("rediss://") {
                return Err(SlowDownError::Configuration(
                    "Redis URL must start with 'redis://' or 'rediss://'".to_string(),
                ));
            }
        }

        if self.cleanup_interval_secs == 0 {
            return Err(SlowDownError::Configuration(
                "Cleanup interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Slow-down options from `SLOWDOWN_CONFIG`, or the defaults.
    pub fn slow_down_options(&self) -> SlowDownResult<SlowDownOptions> {
        match &self.slow_down_config {
            Some(path) => SlowDownOptions::from_json_file(path),
            None => Ok(SlowDownOptions::default()),
        }
    }
}
