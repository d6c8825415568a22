//! Pure service-list filters applied by the selector

use meshrpc_core::Service;

/// Narrows the candidate services for a call
///
/// Any `Fn(Vec<Service>) -> Vec<Service>` is a filter.
pub trait Filter: Send + Sync {
    fn apply(&self, services: Vec<Service>) -> Vec<Service>;
}

impl<F> Filter for F
where
    F: Fn(Vec<Service>) -> Vec<Service> + Send + Sync,
{
    fn apply(&self, services: Vec<Service>) -> Vec<Service> {
        self(services)
    }
}

/// Keep services that expose the named endpoint
#[derive(Clone, Debug)]
pub struct EndpointFilter {
    name: String,
}

impl EndpointFilter {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Filter for EndpointFilter {
    fn apply(&self, services: Vec<Service>) -> Vec<Service> {
        services
            .into_iter()
            .filter(|service| service.endpoints.iter().any(|ep| ep.name == self.name))
            .collect()
    }
}

/// Keep only nodes whose metadata has `key` set to `value`
#[derive(Clone, Debug)]
pub struct LabelFilter {
    key: String,
    value: String,
}

impl LabelFilter {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

impl Filter for LabelFilter {
    fn apply(&self, services: Vec<Service>) -> Vec<Service> {
        services
            .into_iter()
            .filter_map(|mut service| {
                service
                    .nodes
                    .retain(|node| node.metadata.get(&self.key) == Some(&self.value));
                (!service.nodes.is_empty()).then_some(service)
            })
            .collect()
    }
}

/// Keep services with an exact version
#[derive(Clone, Debug)]
pub struct VersionFilter {
    version: String,
}

impl VersionFilter {
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
        }
    }
}

impl Filter for VersionFilter {
    fn apply(&self, services: Vec<Service>) -> Vec<Service> {
        services
            .into_iter()
            .filter(|service| service.version == self.version)
            .collect()
    }
}
