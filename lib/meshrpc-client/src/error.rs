use meshrpc_core::CoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors surfaced by the selector, pool and call loop
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("service {0}: not found")]
    NotFound(String),

    #[error("service {0}: none available")]
    NoneAvailable(String),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error("unsupported Content-Type: {0}")]
    UnsupportedContentType(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("call cancelled")]
    Cancelled,

    #[error("call deadline exceeded")]
    DeadlineExceeded,

    #[error("stream closed")]
    StreamClosed,

    #[error("Registry error: {0}")]
    Registry(#[from] CoreError),

    #[error("Invalid client configuration: {0}")]
    InvalidConfiguration(String),
}

impl ClientError {
    /// Structured status code, when the error carries one
    pub fn code(&self) -> Option<i32> {
        match self {
            ClientError::Rpc(err) if err.code != 0 => Some(err.code),
            _ => None,
        }
    }
}

/// Status error exchanged with remote services
///
/// Serialised as JSON into the `Micro-Error` header and parsed back on the
/// calling side, so the status code survives the round-trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcError {
    pub id: String,
    pub code: i32,
    pub detail: String,
    pub status: String,
}

impl RpcError {
    pub fn new(id: impl Into<String>, detail: impl Into<String>, code: i32) -> Self {
        Self {
            id: id.into(),
            code,
            detail: detail.into(),
            status: status_text(code).to_string(),
        }
    }

    pub fn bad_request(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, detail, 400)
    }

    pub fn unauthorized(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, detail, 401)
    }

    pub fn forbidden(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, detail, 403)
    }

    pub fn not_found(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, detail, 404)
    }

    pub fn method_not_allowed(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, detail, 405)
    }

    pub fn timeout(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, detail, 408)
    }

    pub fn conflict(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, detail, 409)
    }

    pub fn internal_server_error(id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::new(id, detail, 500)
    }

    /// Decode an error string. Anything that is not a JSON status error
    /// becomes a detail-only error with code 0.
    pub fn parse(err: &str) -> Self {
        match serde_json::from_str::<RpcError>(err) {
            Ok(parsed) => parsed,
            Err(_) => Self {
                detail: err.to_string(),
                ..Default::default()
            },
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => f.write_str(&json),
            Err(_) => f.write_str(&self.detail),
        }
    }
}

impl std::error::Error for RpcError {}

fn status_text(code: i32) -> &'static str {
    match code {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        500 => "Internal Server Error",
        _ => "",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_round_trips_through_display() {
        let err = RpcError::internal_server_error("greeter", "boom");
        let parsed = RpcError::parse(&err.to_string());
        assert_eq!(parsed, err);
        assert_eq!(parsed.status, "Internal Server Error");
    }

    #[test]
    fn test_parse_plain_text() {
        let parsed = RpcError::parse("connection refused");
        assert_eq!(parsed.code, 0);
        assert_eq!(parsed.detail, "connection refused");
    }

    #[test]
    fn test_client_error_code() {
        let err: ClientError = RpcError::timeout("client", "slow").into();
        assert_eq!(err.code(), Some(408));
        assert_eq!(ClientError::Cancelled.code(), None);
        assert_eq!(ClientError::Rpc(RpcError::parse("plain")).code(), None);
    }
}
