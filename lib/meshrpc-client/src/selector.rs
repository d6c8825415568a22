//! Node selection: cached lookup, filters, then a strategy

use crate::error::{ClientError, Result};
use crate::filter::Filter;
use meshrpc_core::{CoreError, Node, RegistryCache, Service};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Yields one node per call from a snapshot taken at select time
pub type Next = Box<dyn FnMut() -> Result<Node> + Send>;

/// Turns a filtered service list into a node iterator
pub trait Strategy: Send + Sync {
    fn select(&self, services: Vec<Service>) -> Next;

    fn name(&self) -> &'static str;
}

fn flatten(services: Vec<Service>) -> (String, Vec<Node>) {
    let name = services
        .first()
        .map(|service| service.name.clone())
        .unwrap_or_default();
    let nodes = services.into_iter().flat_map(|service| service.nodes).collect();
    (name, nodes)
}

/// Uniformly random node on every call
#[derive(Clone, Debug, Default)]
pub struct Random;

impl Strategy for Random {
    fn select(&self, services: Vec<Service>) -> Next {
        let (name, nodes) = flatten(services);
        Box::new(move || {
            if nodes.is_empty() {
                return Err(ClientError::NoneAvailable(name.clone()));
            }
            let i = rand::thread_rng().gen_range(0..nodes.len());
            Ok(nodes[i].clone())
        })
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Cycles through the nodes starting from a random offset
#[derive(Clone, Debug, Default)]
pub struct RoundRobin;

impl Strategy for RoundRobin {
    fn select(&self, services: Vec<Service>) -> Next {
        let (name, nodes) = flatten(services);
        let mut i: usize = rand::thread_rng().gen();
        Box::new(move || {
            if nodes.is_empty() {
                return Err(ClientError::NoneAvailable(name.clone()));
            }
            let node = nodes[i % nodes.len()].clone();
            i = i.wrapping_add(1);
            Ok(node)
        })
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

/// Named strategy variants, as written in configuration
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    Random,
    RoundRobin,
}

impl StrategyKind {
    pub fn strategy(&self) -> Arc<dyn Strategy> {
        match self {
            StrategyKind::Random => Arc::new(Random),
            StrategyKind::RoundRobin => Arc::new(RoundRobin),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "random" => Ok(StrategyKind::Random),
            "round_robin" | "roundrobin" => Ok(StrategyKind::RoundRobin),
            other => Err(ClientError::InvalidConfiguration(format!(
                "unknown selector strategy {:?}",
                other
            ))),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.strategy().name())
    }
}

/// Per-call selection options
#[derive(Clone, Default)]
pub struct SelectOptions {
    pub filters: Vec<Arc<dyn Filter>>,
    /// Overrides the selector's strategy for this call
    pub strategy: Option<Arc<dyn Strategy>>,
}

impl SelectOptions {
    pub fn with_filter(mut self, filter: impl Filter + 'static) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn Strategy>) -> Self {
        self.strategy = Some(strategy);
        self
    }
}

impl fmt::Debug for SelectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectOptions")
            .field("filters", &self.filters.len())
            .field("strategy", &self.strategy.as_ref().map(|s| s.name()))
            .finish()
    }
}

/// Picks the node each call attempt goes to
#[async_trait::async_trait]
pub trait Selector: Send + Sync {
    async fn select(&self, service: &str, options: &SelectOptions) -> Result<Next>;

    /// Feedback about the outcome of a call to `node`
    fn mark(&self, service: &str, node: &Node, err: Option<&ClientError>);

    /// Forget feedback recorded for `service`
    fn reset(&self, service: &str);

    fn close(&self);

    fn name(&self) -> &'static str;
}

/// Selector backed by the registry cache
#[derive(Clone)]
pub struct RegistrySelector {
    cache: RegistryCache,
    strategy: Arc<dyn Strategy>,
}

impl RegistrySelector {
    pub fn new(cache: RegistryCache, strategy: StrategyKind) -> Self {
        Self {
            cache,
            strategy: strategy.strategy(),
        }
    }

    pub fn cache(&self) -> &RegistryCache {
        &self.cache
    }
}

#[async_trait::async_trait]
impl Selector for RegistrySelector {
    async fn select(&self, service: &str, options: &SelectOptions) -> Result<Next> {
        let services = match self.cache.get_service(service).await {
            Ok(services) => services,
            Err(CoreError::ServiceNotFound(_)) => {
                return Err(ClientError::NotFound(service.to_string()))
            }
            Err(e) => return Err(ClientError::Registry(e)),
        };
        if services.is_empty() {
            return Err(ClientError::NotFound(service.to_string()));
        }

        let services = options
            .filters
            .iter()
            .fold(services, |services, filter| filter.apply(services));
        if services.iter().all(|s| s.nodes.is_empty()) {
            debug!(service = %service, "Filters removed every node");
            return Err(ClientError::NoneAvailable(service.to_string()));
        }

        let strategy = options.strategy.as_ref().unwrap_or(&self.strategy);
        Ok(strategy.select(services))
    }

    fn mark(&self, service: &str, node: &Node, err: Option<&ClientError>) {
        if let Some(err) = err {
            warn!(service = %service, node = %node.id, error = %err, "Call to node failed");
        }
    }

    fn reset(&self, service: &str) {
        debug!(service = %service, "Resetting selector state");
    }

    fn close(&self) {
        self.cache.stop();
    }

    fn name(&self) -> &'static str {
        "registry"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{LabelFilter, VersionFilter};
    use meshrpc_core::{CacheOptions, MemoryRegistry, RegisterOptions, Registry};
    use std::collections::HashSet;

    async fn selector(nodes: &[(&str, &str)]) -> (Arc<MemoryRegistry>, RegistrySelector) {
        let registry = Arc::new(MemoryRegistry::new());
        if !nodes.is_empty() {
            let service = nodes.iter().fold(Service::new("greeter", "1.0.0"), |s, (id, addr)| {
                s.with_node(Node::new(*id, *addr).with_metadata("zone", "east"))
            });
            registry.register(&service, RegisterOptions::default()).await.unwrap();
        }
        let cache = RegistryCache::new(registry.clone(), CacheOptions::default());
        (registry, RegistrySelector::new(cache, StrategyKind::Random))
    }

    #[tokio::test]
    async fn test_select_empty_registry_is_not_found() {
        let (_registry, selector) = selector(&[]).await;
        let err = selector.select("greeter", &SelectOptions::default()).await.err().unwrap();
        assert_eq!(err, ClientError::NotFound("greeter".to_string()));
        selector.close();
    }

    #[tokio::test]
    async fn test_select_filtered_out_is_none_available() {
        let (_registry, selector) = selector(&[("n1", "a:1")]).await;

        let opts = SelectOptions::default().with_filter(LabelFilter::new("zone", "west"));
        let err = selector.select("greeter", &opts).await.err().unwrap();
        assert_eq!(err, ClientError::NoneAvailable("greeter".to_string()));

        let opts = SelectOptions::default().with_filter(VersionFilter::new("9.9.9"));
        let err = selector.select("greeter", &opts).await.err().unwrap();
        assert_eq!(err, ClientError::NoneAvailable("greeter".to_string()));
        selector.close();
    }

    #[tokio::test]
    async fn test_random_draws_from_every_node() {
        let (_registry, selector) = selector(&[("n1", "a:1"), ("n2", "b:1")]).await;
        let mut next = selector.select("greeter", &SelectOptions::default()).await.unwrap();

        let seen: HashSet<_> = (0..200).map(|_| next().unwrap().id).collect();
        assert_eq!(seen.len(), 2);
        selector.close();
    }

    #[tokio::test]
    async fn test_round_robin_cycles() {
        let (_registry, selector) = selector(&[("n1", "a:1"), ("n2", "b:1"), ("n3", "c:1")]).await;
        let opts = SelectOptions::default().with_strategy(StrategyKind::RoundRobin.strategy());
        let mut next = selector.select("greeter", &opts).await.unwrap();

        let first: Vec<_> = (0..3).map(|_| next().unwrap().id).collect();
        let second: Vec<_> = (0..3).map(|_| next().unwrap().id).collect();
        assert_eq!(first, second);
        assert_eq!(first.iter().collect::<HashSet<_>>().len(), 3);
        selector.close();
    }

    #[tokio::test]
    async fn test_next_keeps_snapshot() {
        let (registry, selector) = selector(&[("n1", "a:1")]).await;
        let mut next = selector.select("greeter", &SelectOptions::default()).await.unwrap();

        registry
            .deregister(&Service::new("greeter", "1.0.0"))
            .await
            .unwrap();
        assert_eq!(next().unwrap().id, "n1");
        selector.close();
    }

    #[tokio::test]
    async fn test_feedback_hooks_leave_selection_intact() {
        let (_registry, selector) = selector(&[("n1", "a:1")]).await;
        let node = Node::new("n1", "a:1");
        selector.mark("greeter", &node, Some(&ClientError::StreamClosed));
        selector.mark("greeter", &node, None);
        selector.reset("greeter");

        let mut next = selector.select("greeter", &SelectOptions::default()).await.unwrap();
        assert_eq!(next().unwrap().id, "n1");
        assert_eq!(selector.name(), "registry");
        selector.close();
    }

    #[test]
    fn test_strategy_kind_parse() {
        assert_eq!("random".parse::<StrategyKind>().unwrap(), StrategyKind::Random);
        assert_eq!("round_robin".parse::<StrategyKind>().unwrap(), StrategyKind::RoundRobin);
        assert!("weighted".parse::<StrategyKind>().is_err());
        assert_eq!(StrategyKind::RoundRobin.to_string(), "round_robin");
    }

    #[test]
    fn test_empty_next_is_none_available() {
        let mut next = Random.select(Vec::new());
        assert!(matches!(next(), Err(ClientError::NoneAvailable(_))));
    }
}
