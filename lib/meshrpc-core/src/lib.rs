//! Core service discovery functionality
//!
//! This library provides:
//! - Service, node and endpoint descriptions
//! - The registry contract and an in-memory registry
//! - Registry watchers and change events
//! - A watch-driven, TTL-backed registry cache

pub mod cache;
pub mod error;
pub mod registry;
pub mod service;
pub mod watcher;

pub use cache::{CacheOptions, RegistryCache};
pub use error::{CoreError, Result};
pub use registry::{MemoryRegistry, RegisterOptions, Registry};
pub use service::{Endpoint, Node, Service, Value};
pub use watcher::{Event, EventType, WatchOptions, Watcher};
