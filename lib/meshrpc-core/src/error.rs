use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by registries, watchers and the registry cache.
///
/// Cloneable so that a single registry fetch can hand the same outcome to
/// every caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Watcher stopped")]
    WatcherStopped,

    #[error("Registry unavailable: {0}")]
    Unavailable(String),

    #[error("Invalid service configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}
