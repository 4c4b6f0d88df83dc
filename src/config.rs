//! Configuration management for Ratewarden.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};
use crate::middleware::MiddlewareOptions;
use crate::ratelimit::{
    Algorithm, BatchOptions, Clock, KeyStrategy, KeyStrategyKind, LimitConfig, RateLimitEngine,
    RateLimitRequest, RateLimiter, RetryPolicy,
};
use crate::store::{ScriptRegistry, Store};

/// Prefix of environment variables that override file settings,
/// e.g. `RATEWARDEN__STORE__URL`.
pub const ENV_PREFIX: &str = "RATEWARDEN";
const ENV_SEPARATOR: &str = "__";

/// Main configuration for a rate limiter deployment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    #[serde(default)]
    pub store: StoreConfig,

    /// The limit applied to every key
    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub batch: BatchConfig,

    #[serde(default)]
    pub middleware: MiddlewareConfig,

    /// Retries for read-only calls
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub cache: CacheConfig,
}

/// Backing store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis connection URL
    #[serde(default = "default_store_url")]
    pub url: String,

    /// Namespace prepended to every key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Extra lifetime of every entry beyond its window, to absorb clock skew
    #[serde(default = "default_ttl_buffer_ms")]
    pub ttl_buffer_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: default_store_url(),
            key_prefix: default_key_prefix(),
            ttl_buffer_ms: default_ttl_buffer_ms(),
        }
    }
}

fn default_store_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "rate_limit".to_string()
}

fn default_ttl_buffer_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_max_requests")]
    pub max_requests: u32,

    #[serde(default)]
    pub algorithm: Algorithm,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
            algorithm: Algorithm::default(),
        }
    }
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max_requests() -> u32 {
    100
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
            concurrency: default_concurrency(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_max_batch_size() -> usize {
    100
}

fn default_concurrency() -> usize {
    10
}

fn default_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MiddlewareConfig {
    /// How requests are grouped into quotas. `custom` is only available in code.
    #[serde(default)]
    pub key_strategy: KeyStrategyKind,

    #[serde(default)]
    pub skip_successful_requests: bool,

    #[serde(default)]
    pub skip_failed_requests: bool,

    #[serde(default = "default_standard_headers")]
    pub standard_headers: bool,

    #[serde(default = "default_message")]
    pub message: String,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            key_strategy: KeyStrategyKind::default(),
            skip_successful_requests: false,
            skip_failed_requests: false,
            standard_headers: default_standard_headers(),
            message: default_message(),
        }
    }
}

fn default_standard_headers() -> bool {
    true
}

fn default_message() -> String {
    crate::middleware::DEFAULT_MESSAGE.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_ms: default_backoff_ms(),
        }
    }
}

fn default_backoff_ms() -> u64 {
    50
}

/// Local denial cache.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default)]
    pub enabled: bool,
}

impl LimiterConfig {
    /// Load configuration from a YAML file, then apply `RATEWARDEN__*`
    /// environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Yaml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| LimiterError::Config(format!("{}: {}", path.display(), e)))?;

        let config: LimiterConfig = settings
            .try_deserialize()
            .map_err(|e| LimiterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string. No environment overrides apply.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: LimiterConfig =
            serde_yaml::from_str(contents).map_err(|e| LimiterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check ranges. Limits follow the same bounds as individual requests.
    pub fn validate(&self) -> Result<()> {
        RateLimitRequest::new("config", self.limits.max_requests, self.limits.window_ms)
            .validate()
            .map_err(|reason| LimiterError::Config(format!("limits: {}", reason)))?;

        if self.store.key_prefix.is_empty() {
            return Err(LimiterError::Config(
                "store.key_prefix must not be empty".to_string(),
            ));
        }
        if self.batch.max_batch_size == 0 {
            return Err(LimiterError::Config(
                "batch.max_batch_size must be positive".to_string(),
            ));
        }
        if self.batch.concurrency == 0 {
            return Err(LimiterError::Config(
                "batch.concurrency must be positive".to_string(),
            ));
        }
        if self.batch.timeout_ms == 0 {
            return Err(LimiterError::Config(
                "batch.timeout_ms must be positive".to_string(),
            ));
        }
        if self.middleware.key_strategy == KeyStrategyKind::Custom {
            return Err(LimiterError::Config(
                "middleware.key_strategy `custom` requires a key function set in code".to_string(),
            ));
        }
        Ok(())
    }

    pub fn limit_config(&self) -> LimitConfig {
        LimitConfig {
            window_ms: self.limits.window_ms,
            max_requests: self.limits.max_requests,
            algorithm: self.limits.algorithm,
        }
    }

    pub fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            max_batch_size: self.batch.max_batch_size,
            concurrency: self.batch.concurrency,
            timeout: Duration::from_millis(self.batch.timeout_ms),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry.max_retries,
            backoff: Duration::from_millis(self.retry.backoff_ms),
        }
    }

    pub fn middleware_options(&self) -> MiddlewareOptions {
        MiddlewareOptions {
            skip_successful_requests: self.middleware.skip_successful_requests,
            skip_failed_requests: self.middleware.skip_failed_requests,
            standard_headers: self.middleware.standard_headers,
            message: self.middleware.message.clone(),
        }
    }

    /// The configured key strategy. `None` for `custom`.
    pub fn key_strategy(&self) -> Option<KeyStrategy> {
        self.middleware.key_strategy.strategy()
    }

    /// Assemble a limiter over `store`.
    pub fn build_limiter(
        &self,
        store: Arc<dyn Store>,
        registry: Arc<ScriptRegistry>,
        clock: Arc<dyn Clock>,
    ) -> RateLimiter {
        let engine = Arc::new(RateLimitEngine::new(
            store,
            registry,
            clock,
            self.store.key_prefix.clone(),
            Duration::from_millis(self.store.ttl_buffer_ms),
        ));
        let limiter = RateLimiter::new(engine, self.limit_config())
            .with_batch_options(self.batch_options())
            .with_retry(self.retry_policy());
        if self.cache.enabled {
            limiter.with_denial_cache()
        } else {
            limiter
        }
    }
}
