//! Registry cache: a TTL-backed mirror of the registry kept fresh by watchers
//!
//! Lookups are served from memory while an entry is valid. A miss performs a
//! single registry fetch per service name no matter how many callers are
//! waiting, then starts one background watcher that folds registry events
//! into the cached entry. When the registry becomes unreachable the last
//! known services keep being served.

use crate::registry::{RegisterOptions, Registry};
use crate::watcher::{Event, EventType, WatchOptions, Watcher};
use crate::{CoreError, Result, Service};
use futures::future::{BoxFuture, FutureExt, Shared};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Default time a fetched service list stays fresh
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Upper bound for the watcher restart backoff exponent (10^4 ms)
const MAX_BACKOFF_EXPONENT: u32 = 4;

/// Registry cache configuration
#[derive(Clone, Debug)]
pub struct CacheOptions {
    pub ttl: Duration,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self { ttl: DEFAULT_TTL }
    }
}

/// Delay before re-opening a failed watch subscription
fn backoff(attempts: u32) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(10u64.pow(attempts.min(MAX_BACKOFF_EXPONENT)))
}

#[derive(Clone, Debug)]
struct CacheEntry {
    services: Vec<Service>,
    expires_at: Instant,
}

impl CacheEntry {
    fn is_valid(&self, now: Instant) -> bool {
        !self.services.is_empty() && now < self.expires_at
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Vec<Service>>>>;

#[derive(Default)]
struct CacheState {
    /// Last registry error; while set, entries are never hard-deleted
    status: Option<CoreError>,
    entries: HashMap<String, CacheEntry>,
    /// Service names with a running watcher
    watched: HashSet<String>,
    /// Outstanding registry fetches, one per service name
    in_flight: HashMap<String, SharedFetch>,
}

impl CacheState {
    fn valid_entry(&self, name: &str) -> Option<Vec<Service>> {
        self.entries
            .get(name)
            .filter(|entry| entry.is_valid(Instant::now()))
            .map(|entry| entry.services.clone())
    }

    fn set(&mut self, name: &str, services: Vec<Service>, ttl: Duration) {
        self.entries.insert(
            name.to_string(),
            CacheEntry {
                services,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    fn del(&mut self, name: &str) {
        if self.status.is_some() {
            // Keep the last known view around during an outage, just stop trusting it
            if let Some(entry) = self.entries.get_mut(name) {
                entry.expires_at = Instant::now();
            }
            return;
        }
        self.entries.remove(name);
    }

    /// Fold a watch event into the cached entry for its service
    fn update(&mut self, event: Event, ttl: Duration) {
        let name = event.service.name.clone();
        if !self.watched.contains(&name) {
            return;
        }
        // Only mirror services somebody has looked up
        let Some(entry) = self.entries.get(&name) else {
            return;
        };

        let incoming = event.service;
        if incoming.nodes.is_empty() {
            if event.event_type == EventType::Delete {
                self.del(&name);
            }
            return;
        }

        let mut services = entry.services.clone();
        let index = services.iter().position(|s| s.version == incoming.version);

        match event.event_type {
            EventType::Create | EventType::Update => {
                match index {
                    Some(i) => {
                        let mut merged = incoming;
                        for cur in &services[i].nodes {
                            if !merged.nodes.iter().any(|n| n.id == cur.id) {
                                merged.nodes.push(cur.clone());
                            }
                        }
                        services[i] = merged;
                    }
                    None => services.push(incoming),
                }
                self.set(&name, services, ttl);
            }
            EventType::Delete => {
                let Some(i) = index else {
                    return;
                };
                services[i]
                    .nodes
                    .retain(|cur| !incoming.nodes.iter().any(|n| n.id == cur.id));
                if !services[i].nodes.is_empty() {
                    self.set(&name, services, ttl);
                    return;
                }

                services.remove(i);
                if services.is_empty() {
                    self.del(&name);
                } else {
                    self.set(&name, services, ttl);
                }
            }
        }
    }
}

struct CacheInner {
    registry: Arc<dyn Registry>,
    options: CacheOptions,
    state: RwLock<CacheState>,
    shutdown: CancellationToken,
}

impl CacheInner {
    /// The one registry round-trip shared by every caller that missed
    async fn fetch(self: Arc<Self>, name: String) -> Result<Vec<Service>> {
        let result = self.registry.get_service(&name).await;

        let mut state = self.state.write().await;
        state.in_flight.remove(&name);

        match result {
            Ok(services) => {
                if state.status.take().is_some() {
                    debug!(service = %name, "Registry reachable again, clearing error status");
                }
                state.set(&name, services.clone(), self.options.ttl);

                if !self.shutdown.is_cancelled() && state.watched.insert(name.clone()) {
                    tokio::spawn(self.clone().run(name));
                }
                Ok(services)
            }
            Err(err) => match state.entries.get(&name) {
                Some(entry) if !entry.services.is_empty() => {
                    warn!(service = %name, error = %err, "Registry lookup failed, serving stale services");
                    let services = entry.services.clone();
                    state.status = Some(err);
                    Ok(services)
                }
                _ => Err(err),
            },
        }
    }

    /// Background watcher loop for one service name
    async fn run(self: Arc<Self>, name: String) {
        debug!(service = %name, "Starting registry watcher");
        let mut attempt = 0u32;

        loop {
            let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..100));
            if !self.pause(jitter).await {
                break;
            }

            let watcher = match self.registry.watch(WatchOptions::service(&name)).await {
                Ok(watcher) => watcher,
                Err(err) => {
                    warn!(service = %name, error = %err, "Failed to open registry watch");
                    self.set_status(err).await;
                    let delay = backoff(attempt);
                    attempt = (attempt + 1).min(MAX_BACKOFF_EXPONENT);
                    if !self.pause(delay).await {
                        break;
                    }
                    continue;
                }
            };
            attempt = 0;

            match self.watch(watcher).await {
                Ok(()) => break,
                Err(err) => {
                    warn!(service = %name, error = %err, "Registry watch failed, restarting");
                    self.set_status(err).await;
                    let delay = backoff(attempt);
                    attempt = (attempt + 1).min(MAX_BACKOFF_EXPONENT);
                    if !self.pause(delay).await {
                        break;
                    }
                }
            }
        }

        self.state.write().await.watched.remove(&name);
        debug!(service = %name, "Registry watcher stopped");
    }

    /// Apply events until the watcher fails. Returns `Ok` only on shutdown.
    async fn watch(&self, mut watcher: Box<dyn Watcher>) -> Result<()> {
        loop {
            let next = tokio::select! {
                _ = self.shutdown.cancelled() => None,
                event = watcher.next() => Some(event),
            };
            let Some(event) = next else {
                watcher.stop();
                return Ok(());
            };
            let event = event?;

            let mut state = self.state.write().await;
            if state.status.take().is_some() {
                debug!(service = %event.service.name, "Watch succeeded, clearing error status");
            }
            state.update(event, self.options.ttl);
        }
    }

    /// Sleep unless shut down first. Returns false on shutdown.
    async fn pause(&self, delay: Duration) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        if delay.is_zero() {
            return true;
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    async fn set_status(&self, err: CoreError) {
        self.state.write().await.status = Some(err);
    }
}

/// RegistryCache wraps a registry with a per-service TTL cache
#[derive(Clone)]
pub struct RegistryCache {
    inner: Arc<CacheInner>,
}

impl RegistryCache {
    pub fn new(registry: Arc<dyn Registry>, options: CacheOptions) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                registry,
                options,
                state: RwLock::new(CacheState::default()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Look up a service, from memory when the cached entry is still valid
    pub async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
        {
            let state = self.inner.state.read().await;
            if let Some(services) = state.valid_entry(name) {
                return Ok(services);
            }
        }

        let fetch = {
            let mut state = self.inner.state.write().await;
            // Someone may have refreshed the entry while we waited for the lock
            if let Some(services) = state.valid_entry(name) {
                return Ok(services);
            }
            match state.in_flight.get(name) {
                Some(fetch) => fetch.clone(),
                None => {
                    let fetch = self
                        .inner
                        .clone()
                        .fetch(name.to_string())
                        .boxed()
                        .shared();
                    state.in_flight.insert(name.to_string(), fetch.clone());
                    fetch
                }
            }
        };

        fetch.await
    }

    /// Last registry error seen, cleared by the next successful fetch or event
    pub async fn status(&self) -> Option<CoreError> {
        self.inner.state.read().await.status.clone()
    }

    /// Whether a background watcher is running for the service
    pub async fn is_watching(&self, name: &str) -> bool {
        self.inner.state.read().await.watched.contains(name)
    }

    /// Stop every watcher and refuse to start new ones. Safe to call repeatedly.
    pub fn stop(&self) {
        if !self.inner.shutdown.is_cancelled() {
            debug!("Stopping registry cache watchers");
        }
        self.inner.shutdown.cancel();
    }

    pub fn ttl(&self) -> Duration {
        self.inner.options.ttl
    }
}

#[async_trait::async_trait]
impl Registry for RegistryCache {
    async fn register(&self, service: &Service, options: RegisterOptions) -> Result<()> {
        self.inner.registry.register(service, options).await
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        self.inner.registry.deregister(service).await
    }

    async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
        RegistryCache::get_service(self, name).await
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        self.inner.registry.list_services().await
    }

    async fn watch(&self, options: WatchOptions) -> Result<Box<dyn Watcher>> {
        self.inner.registry.watch(options).await
    }

    fn name(&self) -> &'static str {
        "cache"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;
    use crate::Node;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Memory registry that counts lookups and can be made to fail
    struct CountingRegistry {
        inner: MemoryRegistry,
        fetches: AtomicUsize,
        failing: AtomicBool,
        broken_watch: AtomicBool,
        watches: Mutex<Vec<Instant>>,
        delay: Duration,
    }

    /// Watcher that opens fine and fails on first use
    struct BrokenWatcher;

    #[async_trait::async_trait]
    impl Watcher for BrokenWatcher {
        async fn next(&mut self) -> Result<Event> {
            Err(CoreError::Unavailable("watch dropped".to_string()))
        }

        fn stop(&mut self) {}
    }

    impl CountingRegistry {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                inner: MemoryRegistry::new(),
                fetches: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                broken_watch: AtomicBool::new(false),
                watches: Mutex::new(Vec::new()),
                delay,
            })
        }

        fn fetches(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl Registry for CountingRegistry {
        async fn register(&self, service: &Service, options: RegisterOptions) -> Result<()> {
            self.inner.register(service, options).await
        }

        async fn deregister(&self, service: &Service) -> Result<()> {
            self.inner.deregister(service).await
        }

        async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(CoreError::Unavailable("registry down".to_string()));
            }
            self.inner.get_service(name).await
        }

        async fn list_services(&self) -> Result<Vec<Service>> {
            self.inner.list_services().await
        }

        async fn watch(&self, options: WatchOptions) -> Result<Box<dyn Watcher>> {
            self.watches.lock().unwrap().push(Instant::now());
            if self.broken_watch.load(Ordering::SeqCst) {
                return Ok(Box::new(BrokenWatcher));
            }
            self.inner.watch(options).await
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn greeter(nodes: &[(&str, &str)]) -> Service {
        nodes.iter().fold(Service::new("greeter", "1.0.0"), |s, (id, addr)| {
            s.with_node(Node::new(*id, *addr))
        })
    }

    async fn setup(ttl: Duration, delay: Duration) -> (Arc<CountingRegistry>, RegistryCache) {
        let registry = CountingRegistry::new(delay);
        registry
            .register(&greeter(&[("n1", "10.0.0.1:8080")]), RegisterOptions::default())
            .await
            .unwrap();
        let cache = RegistryCache::new(registry.clone(), CacheOptions { ttl });
        (registry, cache)
    }

    #[test]
    fn test_backoff() {
        assert_eq!(backoff(0), Duration::ZERO);
        assert_eq!(backoff(1), Duration::from_millis(10));
        assert_eq!(backoff(3), Duration::from_millis(1000));
        assert_eq!(backoff(9), Duration::from_millis(10_000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_fetch() {
        let (registry, cache) = setup(DEFAULT_TTL, Duration::from_millis(50)).await;

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_service("greeter").await })
            })
            .collect();

        for handle in handles {
            let services = handle.await.unwrap().unwrap();
            assert_eq!(services[0].nodes[0].id, "n1");
        }
        assert_eq!(registry.fetches(), 1);
        cache.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_valid_entry_skips_registry() {
        let (registry, cache) = setup(DEFAULT_TTL, Duration::ZERO).await;

        let first = cache.get_service("greeter").await.unwrap();
        let second = cache.get_service("greeter").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.fetches(), 1);
        cache.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_service_matches_registered_service() {
        let registry = CountingRegistry::new(Duration::ZERO);
        let mut service = greeter(&[("n1", "10.0.0.1:8080")])
            .with_endpoint(crate::Endpoint::new("Greeter.Hello"));
        service.metadata.insert("team".to_string(), "edge".to_string());
        service.nodes[0]
            .metadata
            .insert("protocol".to_string(), "mucp".to_string());
        registry
            .register(&service, RegisterOptions::default())
            .await
            .unwrap();
        let cache = RegistryCache::new(registry.clone(), CacheOptions { ttl: DEFAULT_TTL });

        assert_eq!(cache.get_service("greeter").await.unwrap(), vec![service.clone()]);
        assert_eq!(cache.get_service("greeter").await.unwrap(), vec![service]);
        assert_eq!(registry.fetches(), 1);
        cache.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entry_refetches() {
        let (registry, cache) = setup(Duration::from_secs(1), Duration::ZERO).await;

        cache.get_service("greeter").await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        cache.get_service("greeter").await.unwrap();
        assert_eq!(registry.fetches(), 2);
        cache.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_serves_stale_services_when_registry_fails() {
        let (registry, cache) = setup(Duration::from_secs(1), Duration::ZERO).await;

        let fresh = cache.get_service("greeter").await.unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        registry.failing.store(true, Ordering::SeqCst);

        let stale = cache.get_service("greeter").await.unwrap();
        assert_eq!(fresh, stale);
        assert_eq!(
            cache.status().await,
            Some(CoreError::Unavailable("registry down".to_string()))
        );

        registry.failing.store(false, Ordering::SeqCst);
        cache.get_service("greeter").await.unwrap();
        assert_eq!(cache.status().await, None);
        cache.stop();
    }

    #[tokio::test]
    async fn test_cold_miss_propagates_error() {
        let (registry, cache) = setup(DEFAULT_TTL, Duration::ZERO).await;
        registry.failing.store(true, Ordering::SeqCst);

        let err = cache.get_service("greeter").await.unwrap_err();
        assert_eq!(err, CoreError::Unavailable("registry down".to_string()));
        assert!(!cache.is_watching("greeter").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_event_updates_entry() {
        let (registry, cache) = setup(DEFAULT_TTL, Duration::ZERO).await;

        cache.get_service("greeter").await.unwrap();
        assert!(cache.is_watching("greeter").await);
        // let the watcher subscribe
        tokio::time::sleep(Duration::from_millis(200)).await;

        registry
            .register(&greeter(&[("n2", "10.0.0.2:8080")]), RegisterOptions::default())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let services = cache.get_service("greeter").await.unwrap();
        let mut ids: Vec<_> = services[0].nodes.iter().map(|n| n.id.clone()).collect();
        ids.sort();
        assert_eq!(ids, vec!["n1", "n2"]);
        assert_eq!(registry.fetches(), 1);
        cache.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_event_invalidates_entry() {
        let (registry, cache) = setup(DEFAULT_TTL, Duration::ZERO).await;

        cache.get_service("greeter").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        registry
            .deregister(&greeter(&[("n1", "10.0.0.1:8080")]))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let result = cache.get_service("greeter").await;
        assert!(matches!(result, Err(CoreError::ServiceNotFound(_))));
        assert_eq!(registry.fetches(), 2);
        cache.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_idempotent_and_ends_watchers() {
        let (_registry, cache) = setup(DEFAULT_TTL, Duration::ZERO).await;

        cache.get_service("greeter").await.unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(cache.is_watching("greeter").await);

        cache.stop();
        cache.stop();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!cache.is_watching("greeter").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_restart_backoff_resets_after_open() {
        let (registry, cache) = setup(DEFAULT_TTL, Duration::ZERO).await;
        registry.broken_watch.store(true, Ordering::SeqCst);

        cache.get_service("greeter").await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
        cache.stop();

        let watches = registry.watches.lock().unwrap().clone();
        assert!(watches.len() > 100, "only {} subscriptions", watches.len());
        for pair in watches.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap < Duration::from_millis(200), "restart gap {:?}", gap);
        }
    }

    #[test]
    fn test_update_ignores_unlooked_services() {
        let mut state = CacheState::default();
        state.watched.insert("greeter".to_string());
        state.update(
            Event::new(EventType::Create, greeter(&[("n1", "a:1")])),
            DEFAULT_TTL,
        );
        assert!(state.entries.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_during_outage_only_invalidates() {
        let mut state = CacheState::default();
        state.watched.insert("greeter".to_string());
        state.set("greeter", vec![greeter(&[("n1", "a:1")])], DEFAULT_TTL);
        state.status = Some(CoreError::Unavailable("down".to_string()));

        state.update(
            Event::new(EventType::Delete, greeter(&[("n1", "a:1")])),
            DEFAULT_TTL,
        );
        assert!(state.entries.contains_key("greeter"));
        assert!(state.valid_entry("greeter").is_none());
    }
}
