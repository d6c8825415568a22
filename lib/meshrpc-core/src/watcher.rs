//! Registry change events and the watcher abstraction

use crate::{Result, Service};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of change reported by a registry watcher
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
    Create,
    Delete,
    Update,
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventType::Create => "create",
            EventType::Delete => "delete",
            EventType::Update => "update",
        };
        f.write_str(s)
    }
}

/// A single registry change
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub service: Service,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(event_type: EventType, service: Service) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type,
            service,
            timestamp: Utc::now(),
        }
    }
}

/// Options for opening a watch subscription
#[derive(Clone, Debug, Default)]
pub struct WatchOptions {
    /// Only report events for this service name
    pub service: Option<String>,
}

impl WatchOptions {
    pub fn service(name: impl Into<String>) -> Self {
        Self {
            service: Some(name.into()),
        }
    }

    /// Whether an event for `name` passes this filter
    pub fn matches(&self, name: &str) -> bool {
        self.service.as_deref().map_or(true, |s| s == name)
    }
}

/// A long-lived subscription to registry changes
#[async_trait::async_trait]
pub trait Watcher: Send {
    /// Wait for the next event. Returns `CoreError::WatcherStopped` once stopped.
    async fn next(&mut self) -> Result<Event>;

    /// Stop the subscription
    fn stop(&mut self);
}
