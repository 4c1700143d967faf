use super::predicate::Predicate;
use crate::config::{RetryConfig, RouteConfig};
use crate::error::GatewayError;
use crate::proxy::context::RequestContext;
use crate::proxy::fallback::{FallbackCatalog, FallbackPayload};
use crate::proxy::filter::{build_route_filters, Filter, FilterBuildContext};
use std::sync::Arc;
use std::time::Duration;

/// A route with its predicates and filters compiled, ready to serve.
#[derive(Debug)]
pub struct CompiledRoute {
    pub id: String,
    pub predicates: Vec<Predicate>,
    pub filters: Vec<Filter>,
    /// Logical service name, `lb://` already removed.
    pub service: String,
    pub fallback: Option<Arc<FallbackPayload>>,
    pub timeout: Duration,
    pub retry: Option<RetryConfig>,
}

impl CompiledRoute {
    fn compile(cfg: &RouteConfig, ctx: &BuildContext<'_>) -> Result<Self, GatewayError> {
        let predicates = cfg
            .predicates
            .iter()
            .map(Predicate::compile)
            .collect::<Result<Vec<_>, _>>()?;
        let filters = build_route_filters(cfg, &ctx.filters)?;

        let fallback = match cfg.fallback {
            Some(ref id) => Some(ctx.fallbacks.get(id).ok_or_else(|| {
                GatewayError::Config(format!("route '{}': unknown fallback '{}'", cfg.id, id))
            })?),
            None => None,
        };

        Ok(Self {
            id: cfg.id.clone(),
            predicates,
            filters,
            service: cfg.service_name().to_string(),
            fallback,
            timeout: Duration::from_millis(cfg.timeout_ms.unwrap_or(ctx.default_timeout_ms)),
            retry: cfg.retry.clone(),
        })
    }

    /// All predicates must hold. A route without predicates matches everything.
    pub fn matches(&self, ctx: &RequestContext) -> bool {
        self.predicates.iter().all(|p| p.matches(ctx))
    }
}

/// Everything outside a single route that compiling one needs.
pub struct BuildContext<'a> {
    pub filters: FilterBuildContext<'a>,
    pub fallbacks: &'a FallbackCatalog,
    pub default_timeout_ms: u64,
}

/// Ordered route list. Immutable once built; a reload builds a new table and
/// swaps it in whole.
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<Arc<CompiledRoute>>,
}

impl RouteTable {
    pub fn new(routes: &[RouteConfig], ctx: &BuildContext<'_>) -> Result<Self, GatewayError> {
        let mut compiled = Vec::with_capacity(routes.len());
        for cfg in routes {
            let route = CompiledRoute::compile(cfg, ctx)?;
            tracing::debug!(
                "routing: compiled route, id={}, service={}, predicates={}, filters={}",
                route.id,
                route.service,
                route.predicates.len(),
                route.filters.len()
            );
            compiled.push(Arc::new(route));
        }
        Ok(Self { routes: compiled })
    }

    /// First route in declaration order whose predicates all hold.
    pub fn match_route(&self, ctx: &RequestContext) -> Option<Arc<CompiledRoute>> {
        self.routes.iter().find(|r| r.matches(ctx)).cloned()
    }

    pub fn all_routes(&self) -> &[Arc<CompiledRoute>] {
        &self.routes
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}
