//! Service registry contract and an in-memory implementation

use crate::watcher::{Event, EventType, WatchOptions, Watcher};
use crate::{CoreError, Result, Service};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

const EVENT_BUFFER: usize = 128;

/// Options applied when registering a service
#[derive(Clone, Debug, Default)]
pub struct RegisterOptions {
    /// Nodes disappear from lookups this long after their last registration
    pub ttl: Option<Duration>,
}

impl RegisterOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self { ttl: Some(ttl) }
    }
}

/// Authoritative directory mapping service names to running nodes
#[async_trait::async_trait]
pub trait Registry: Send + Sync {
    /// Register or refresh a service's nodes
    async fn register(&self, service: &Service, options: RegisterOptions) -> Result<()>;

    /// Remove a service's nodes; with no nodes given, the whole version goes
    async fn deregister(&self, service: &Service) -> Result<()>;

    /// Every version of a service that currently has nodes
    async fn get_service(&self, name: &str) -> Result<Vec<Service>>;

    /// Every registered service
    async fn list_services(&self) -> Result<Vec<Service>>;

    /// Open a subscription to registry changes
    async fn watch(&self, options: WatchOptions) -> Result<Box<dyn Watcher>>;

    fn name(&self) -> &'static str;
}

/// A registered version of a service together with per-node expiry
#[derive(Clone, Debug)]
struct Record {
    service: Service,
    expiry: HashMap<String, Instant>,
}

impl Record {
    /// Copy of the service without expired nodes
    fn live(&self, now: Instant) -> Service {
        let mut service = self.service.clone();
        service
            .nodes
            .retain(|node| self.expiry.get(&node.id).map_or(true, |at| *at > now));
        service
    }
}

/// MemoryRegistry keeps every registration in process memory
pub struct MemoryRegistry {
    // Map of service name to version to record
    services: Arc<RwLock<HashMap<String, HashMap<String, Record>>>>,
    events: broadcast::Sender<Event>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            services: Arc::new(RwLock::new(HashMap::new())),
            events,
        }
    }

    /// Get count of registered services
    pub async fn service_count(&self) -> usize {
        let services = self.services.read().await;
        services.len()
    }

    fn notify(&self, event: Event) {
        debug!(
            service = %event.service.name,
            event = %event.event_type,
            "Publishing registry event"
        );
        // No subscribers is not an error
        let _ = self.events.send(event);
    }
}

impl Default for MemoryRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, service: &Service, options: RegisterOptions) -> Result<()> {
        if service.name.is_empty() {
            return Err(CoreError::InvalidConfiguration(
                "service name is empty".to_string(),
            ));
        }

        let now = Instant::now();
        let event_type = {
            let mut services = self.services.write().await;
            let versions = services.entry(service.name.clone()).or_default();
            let event_type = if versions.contains_key(&service.version) {
                EventType::Update
            } else {
                EventType::Create
            };

            let record = versions
                .entry(service.version.clone())
                .or_insert_with(|| Record {
                    service: Service {
                        nodes: Vec::new(),
                        ..service.clone()
                    },
                    expiry: HashMap::new(),
                });
            record.service.metadata = service.metadata.clone();
            record.service.endpoints = service.endpoints.clone();

            for node in &service.nodes {
                match record.service.nodes.iter_mut().find(|n| n.id == node.id) {
                    Some(existing) => *existing = node.clone(),
                    None => record.service.nodes.push(node.clone()),
                }
                match options.ttl {
                    Some(ttl) => {
                        record.expiry.insert(node.id.clone(), now + ttl);
                    }
                    None => {
                        record.expiry.remove(&node.id);
                    }
                }
            }
            event_type
        };

        debug!("Registered service: {} {}", service.name, service.version);
        self.notify(Event::new(event_type, service.clone()));
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        let removed = {
            let mut services = self.services.write().await;
            let Some(versions) = services.get_mut(&service.name) else {
                return Ok(());
            };

            let mut removed = service.clone();
            if let Some(record) = versions.get_mut(&service.version) {
                if service.nodes.is_empty() {
                    removed.nodes = record.service.nodes.clone();
                    versions.remove(&service.version);
                } else {
                    record
                        .service
                        .nodes
                        .retain(|cur| !service.nodes.iter().any(|n| n.id == cur.id));
                    for node in &service.nodes {
                        record.expiry.remove(&node.id);
                    }
                    if record.service.nodes.is_empty() {
                        versions.remove(&service.version);
                    }
                }
            }

            if versions.is_empty() {
                services.remove(&service.name);
            }
            removed
        };

        debug!("Deregistered service: {} {}", service.name, service.version);
        self.notify(Event::new(EventType::Delete, removed));
        Ok(())
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
        let now = Instant::now();
        let services = self.services.read().await;
        let versions = services
            .get(name)
            .ok_or_else(|| CoreError::ServiceNotFound(name.to_string()))?;

        let live: Vec<Service> = versions
            .values()
            .map(|record| record.live(now))
            .filter(|service| !service.nodes.is_empty())
            .collect();

        if live.is_empty() {
            return Err(CoreError::ServiceNotFound(name.to_string()));
        }
        Ok(live)
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        let now = Instant::now();
        let services = self.services.read().await;
        Ok(services
            .values()
            .flat_map(|versions| versions.values().map(|record| record.live(now)))
            .collect())
    }

    async fn watch(&self, options: WatchOptions) -> Result<Box<dyn Watcher>> {
        Ok(Box::new(MemoryWatcher {
            events: self.events.subscribe(),
            options,
            stopped: false,
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Watcher over a `MemoryRegistry` event channel
pub struct MemoryWatcher {
    events: broadcast::Receiver<Event>,
    options: WatchOptions,
    stopped: bool,
}

#[async_trait::async_trait]
impl Watcher for MemoryWatcher {
    async fn next(&mut self) -> Result<Event> {
        loop {
            if self.stopped {
                return Err(CoreError::WatcherStopped);
            }
            match self.events.recv().await {
                Ok(event) if self.options.matches(&event.service.name) => return Ok(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Registry watcher lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.stopped = true;
                }
            }
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}
