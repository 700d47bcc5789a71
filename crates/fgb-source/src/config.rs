//! Configuration for FlatGeobuf sources and range fetchers.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::parse_byte_size;

/// Configuration for a [`SourceCache`](crate::SourceCache).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCacheConfig {
    /// Budget for parsed source indexes (header + packed R-tree), in bytes.
    pub max_index_size: u64,

    /// Budget for the shared byte-range cache, in bytes.
    pub range_cache_size: u64,

    /// Target size of one feature page request, in bytes.
    pub page_size: u64,

    /// Bytes requested when first opening a source. Large enough to hold the
    /// header and, for small datasets, the whole index.
    pub initial_header_request_length: u64,
}

impl Default for SourceCacheConfig {
    fn default() -> Self {
        Self {
            max_index_size: 64 * 1024 * 1024,
            range_cache_size: 128 * 1024 * 1024,
            page_size: 5 * 1024 * 1024,
            initial_header_request_length: 1024 * 1024,
        }
    }
}

impl SourceCacheConfig {
    /// Load configuration from environment variables.
    ///
    /// Sizes accept human readable values such as `64mb` or `1GB`. Values
    /// that fail to parse are ignored and the default is kept.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(size) = env_byte_size("SOURCE_CACHE_SIZE") {
            config.max_index_size = size;
        }

        if let Some(size) = env_byte_size("RANGE_CACHE_SIZE") {
            config.range_cache_size = size;
        }

        if let Some(size) = env_byte_size("FGB_PAGE_SIZE") {
            config.page_size = size;
        }

        if let Some(size) = env_byte_size("FGB_HEADER_FETCH_SIZE") {
            config.initial_header_request_length = size;
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_index_size == 0 {
            return Err("max_index_size must be > 0".to_string());
        }

        if self.range_cache_size == 0 {
            return Err("range_cache_size must be > 0".to_string());
        }

        if self.page_size == 0 {
            return Err("page_size must be > 0".to_string());
        }

        // magic (8) + header length (4)
        if self.initial_header_request_length < 12 {
            return Err("initial_header_request_length must be >= 12".to_string());
        }

        Ok(())
    }
}

/// Configuration for [`HttpRangeFetcher`](crate::HttpRangeFetcher).
#[derive(Debug, Clone)]
pub struct HttpFetcherConfig {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub max_retries: u32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub user_agent: String,
}

impl Default for HttpFetcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(10),
            max_retries: 3,
            initial_retry_delay: Duration::from_millis(250),
            max_retry_delay: Duration::from_secs(10),
            user_agent: format!("fgb-source/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl HttpFetcherConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = std::env::var("HTTP_TIMEOUT_SECS") {
            if let Ok(secs) = val.parse() {
                config.request_timeout = Duration::from_secs(secs);
            }
        }

        if let Ok(val) = std::env::var("HTTP_MAX_RETRIES") {
            if let Ok(retries) = val.parse() {
                config.max_retries = retries;
            }
        }

        if let Ok(val) = std::env::var("HTTP_RETRY_DELAY_MS") {
            if let Ok(ms) = val.parse() {
                config.initial_retry_delay = Duration::from_millis(ms);
            }
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.request_timeout.is_zero() {
            return Err("request_timeout must be > 0".to_string());
        }

        if self.initial_retry_delay > self.max_retry_delay {
            return Err("initial_retry_delay must not exceed max_retry_delay".to_string());
        }

        Ok(())
    }

    /// Backoff delay before retry number `attempt` (1-based).
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_retry_delay
            .saturating_mul(factor)
            .min(self.max_retry_delay)
    }
}

fn env_byte_size(key: &str) -> Option<u64> {
    std::env::var(key)
        .ok()
        .and_then(|val| parse_byte_size(&val).ok())
}
