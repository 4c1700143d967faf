use super::balancer::Balancer;
use crate::config::ServiceConfig;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

/// One concrete backend address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// `host:port`, used for the upstream URI and the `Host` header.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    UnknownService(String),
    NoInstances(String),
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolveError::UnknownService(name) => write!(f, "unknown service '{}'", name),
            ResolveError::NoInstances(name) => {
                write!(f, "no instances available for service '{}'", name)
            }
        }
    }
}

impl std::error::Error for ResolveError {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSummary {
    pub name: String,
    pub instances: usize,
}

/// Maps a logical service name to a concrete endpoint. Called once per
/// dispatch attempt, so implementations may rotate between instances.
pub trait ServiceResolver: Send + Sync {
    fn resolve(&self, service: &str) -> Result<Endpoint, ResolveError>;

    fn list_services(&self) -> Vec<ServiceSummary>;
}

struct ServiceEntry {
    balancer: Balancer,
}

/// Resolver backed by the `[[services]]` section of the config.
pub struct StaticDiscovery {
    services: HashMap<String, ServiceEntry>,
}

impl StaticDiscovery {
    pub fn from_config(services: &[ServiceConfig]) -> Self {
        let services = services
            .iter()
            .map(|svc| {
                let nodes = svc
                    .nodes
                    .iter()
                    .map(|n| {
                        (
                            Endpoint {
                                scheme: svc.scheme.clone(),
                                host: n.host.clone(),
                                port: n.port,
                            },
                            n.weight,
                        )
                    })
                    .collect();
                tracing::debug!(
                    "discovery: static: registered service, name={}, lb={}, nodes={}",
                    svc.name,
                    svc.lb,
                    svc.nodes.len()
                );
                (
                    svc.name.clone(),
                    ServiceEntry {
                        balancer: Balancer::new(&svc.lb, nodes),
                    },
                )
            })
            .collect();
        Self { services }
    }
}

impl ServiceResolver for StaticDiscovery {
    fn resolve(&self, service: &str) -> Result<Endpoint, ResolveError> {
        let entry = self
            .services
            .get(service)
            .ok_or_else(|| ResolveError::UnknownService(service.to_string()))?;
        entry
            .balancer
            .select()
            .cloned()
            .ok_or_else(|| ResolveError::NoInstances(service.to_string()))
    }

    fn list_services(&self) -> Vec<ServiceSummary> {
        let mut out: Vec<ServiceSummary> = self
            .services
            .iter()
            .map(|(name, entry)| ServiceSummary {
                name: name.clone(),
                instances: entry.balancer.instance_count(),
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}
