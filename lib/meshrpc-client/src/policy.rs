//! Retry and backoff policies for the call loop

use crate::context::CallContext;
use crate::error::{ClientError, Result};
use crate::request::Request;
use std::sync::Arc;
use std::time::Duration;

/// Default number of retries after the first attempt
pub const DEFAULT_RETRIES: u32 = 5;

/// Default bound on one request/response exchange
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Default bound on each stream receive
pub const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait before the attempt after `attempt`
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Decides whether a failed attempt is retried
pub type RetryFn =
    Arc<dyn Fn(&CallContext, &Request, u32, &ClientError) -> Result<bool> + Send + Sync>;

/// `attempt^e * 100ms`, and no wait at all for attempt 0
pub fn exponential_backoff(attempt: u32) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let factor = f64::from(attempt).powf(std::f64::consts::E) as u64;
    Duration::from_millis(factor.saturating_mul(100))
}

/// Retry timeouts (408) and internal errors (500) only
pub fn retry_on_error(
    _ctx: &CallContext,
    _req: &Request,
    _attempt: u32,
    err: &ClientError,
) -> Result<bool> {
    Ok(matches!(err.code(), Some(408) | Some(500)))
}

/// Retry every failure
pub fn retry_always(
    _ctx: &CallContext,
    _req: &Request,
    _attempt: u32,
    _err: &ClientError,
) -> Result<bool> {
    Ok(true)
}

pub fn default_backoff() -> BackoffFn {
    Arc::new(exponential_backoff)
}

pub fn default_retry() -> RetryFn {
    Arc::new(retry_on_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcError;

    fn check(retry: &RetryFn, err: ClientError) -> bool {
        let req = Request::new("greeter", "Greeter.Hello", Vec::new());
        retry(&CallContext::new(), &req, 0, &err).unwrap()
    }

    #[test]
    fn test_exponential_backoff() {
        assert_eq!(exponential_backoff(0), Duration::ZERO);
        assert_eq!(exponential_backoff(1), Duration::from_millis(100));
        assert_eq!(exponential_backoff(2), Duration::from_millis(600));
        assert_eq!(exponential_backoff(3), Duration::from_millis(1900));
    }

    #[test]
    fn test_retry_on_error() {
        let retry = default_retry();
        assert!(check(&retry, RpcError::timeout("c", "slow").into()));
        assert!(check(&retry, RpcError::internal_server_error("c", "boom").into()));
        assert!(!check(&retry, RpcError::bad_request("c", "bad").into()));
        assert!(!check(&retry, ClientError::NotFound("greeter".into())));
        assert!(!check(&retry, ClientError::UnsupportedContentType("text/plain".into())));
    }

    #[test]
    fn test_retry_always() {
        let retry: RetryFn = Arc::new(retry_always);
        assert!(check(&retry, RpcError::bad_request("c", "bad").into()));
    }
}
