//! Client configuration loaded from YAML

use crate::codec::DEFAULT_CONTENT_TYPE;
use crate::error::{ClientError, Result};
use crate::options::CallOptions;
use crate::pool::{PoolOptions, DEFAULT_POOL_SIZE};
use crate::policy::DEFAULT_RETRIES;
use crate::response_cache::DEFAULT_CAPACITY;
use crate::selector::StrategyKind;
use meshrpc_core::CacheOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub content_type: String,
    pub pool_size: usize,
    pub pool_ttl_secs: u64,
    /// Registry cache entry lifetime
    pub cache_ttl_secs: u64,
    pub retries: u32,
    pub request_timeout_ms: u64,
    pub stream_timeout_ms: u64,
    pub dial_timeout_ms: u64,
    pub strategy: StrategyKind,
    pub response_cache_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            pool_size: DEFAULT_POOL_SIZE,
            pool_ttl_secs: 60,
            cache_ttl_secs: 60,
            retries: DEFAULT_RETRIES,
            request_timeout_ms: 30_000,
            stream_timeout_ms: 30_000,
            dial_timeout_ms: 5_000,
            strategy: StrategyKind::Random,
            response_cache_capacity: DEFAULT_CAPACITY,
        }
    }
}

impl ClientConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| ClientError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|e| {
            ClientError::InvalidConfiguration(format!("{}: {}", path.display(), e))
        })?;
        Self::from_yaml_str(&yaml)
    }

    fn validate(&self) -> Result<()> {
        if self.content_type.is_empty() {
            return Err(ClientError::InvalidConfiguration(
                "content_type must not be empty".to_string(),
            ));
        }
        if self.pool_size == 0 {
            return Err(ClientError::InvalidConfiguration(
                "pool_size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn call_options(&self) -> CallOptions {
        CallOptions::default()
            .with_retries(self.retries)
            .with_request_timeout(Duration::from_millis(self.request_timeout_ms))
            .with_stream_timeout(Duration::from_millis(self.stream_timeout_ms))
            .with_dial_timeout(Duration::from_millis(self.dial_timeout_ms))
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            size: self.pool_size,
            ttl: Duration::from_secs(self.pool_ttl_secs),
        }
    }

    pub fn cache_options(&self) -> CacheOptions {
        CacheOptions {
            ttl: Duration::from_secs(self.cache_ttl_secs),
        }
    }
}
