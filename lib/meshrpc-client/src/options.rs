use crate::policy::{
    default_backoff, default_retry, BackoffFn, RetryFn, DEFAULT_REQUEST_TIMEOUT, DEFAULT_RETRIES,
    DEFAULT_STREAM_TIMEOUT,
};
use crate::selector::SelectOptions;
use crate::transport::DEFAULT_DIAL_TIMEOUT;
use std::fmt;
use std::time::Duration;

/// Options for a single call
#[derive(Clone)]
pub struct CallOptions {
    /// Fixed node addresses; bypasses the selector when non-empty
    pub address: Vec<String>,
    /// Retries after the first attempt
    pub retries: u32,
    pub backoff: BackoffFn,
    pub retry: RetryFn,
    pub request_timeout: Duration,
    pub stream_timeout: Duration,
    pub dial_timeout: Duration,
    /// Cache successful responses for this long
    pub cache_expiry: Option<Duration>,
    pub select_options: SelectOptions,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            address: Vec::new(),
            retries: DEFAULT_RETRIES,
            backoff: default_backoff(),
            retry: default_retry(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            cache_expiry: None,
            select_options: SelectOptions::default(),
        }
    }
}

impl CallOptions {
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address.push(address.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffFn) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retry(mut self, retry: RetryFn) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_stream_timeout(mut self, timeout: Duration) -> Self {
        self.stream_timeout = timeout;
        self
    }

    pub fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Serve identical requests from the response cache for `ttl`
    pub fn with_cache(mut self, ttl: Duration) -> Self {
        self.cache_expiry = Some(ttl);
        self
    }

    pub fn with_select_options(mut self, options: SelectOptions) -> Self {
        self.select_options = options;
        self
    }
}

impl fmt::Debug for CallOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("address", &self.address)
            .field("retries", &self.retries)
            .field("request_timeout", &self.request_timeout)
            .field("stream_timeout", &self.stream_timeout)
            .field("dial_timeout", &self.dial_timeout)
            .field("cache_expiry", &self.cache_expiry)
            .field("select_options", &self.select_options)
            .finish()
    }
}
