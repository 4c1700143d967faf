pub mod auth;
pub mod cors;
pub mod headers;
pub mod rate_limit;
mod trace;

use crate::config::{CorsConfig, FilterConfig, GlobalFilterKind, RateLimitConfig, RouteConfig};
use crate::error::GatewayError;
use crate::proxy::context::{RequestContext, ResponseContext};
use auth::AuthGate;
use cors::CorsPolicy;
use headers::HeaderRule;
use rate_limit::RouteRateLimit;
use std::sync::Arc;

/// Result of a filter's request phase.
pub enum FilterResult {
    /// Continue to the next filter.
    Continue,
    /// Short-circuit with a response built by the filter itself.
    Respond(ResponseContext),
    /// Short-circuit with an error; the chain normalizes it.
    Reject(GatewayError),
}

/// Enum-based filter: static dispatch, exhaustive match.
///
/// Filters are built once when the route table or the global chain is
/// compiled (startup and hot reload), never per request. Per-request data
/// lives in `RequestContext`.
///
/// Adding a new filter:
/// 1. Add a module under `filter/`
/// 2. Add a variant here
/// 3. Implement the two match arms in `on_request` / `on_response`
/// 4. Add construction logic in `build_route_filters` or `build_global_filters`
pub enum Filter {
    RequestId,
    AccessLog,
    Cors(Arc<CorsPolicy>),
    ResponseTiming,
    StripPrefix { parts: usize },
    AddRequestHeader(HeaderRule),
    AddResponseHeader(HeaderRule),
    Authenticate(Arc<AuthGate>),
    RateLimit(Arc<RouteRateLimit>),
}

impl std::fmt::Debug for Filter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Filter::StripPrefix { parts } => {
                f.debug_struct("StripPrefix").field("parts", parts).finish()
            }
            Filter::AddRequestHeader(rule) | Filter::AddResponseHeader(rule) => f
                .debug_struct(self.name())
                .field("name", &rule.name)
                .finish(),
            _ => f.write_str(self.name()),
        }
    }
}

impl Filter {
    pub fn name(&self) -> &'static str {
        match self {
            Filter::RequestId => "request_id",
            Filter::AccessLog => "access_log",
            Filter::Cors(_) => "cors",
            Filter::ResponseTiming => "response_timing",
            Filter::StripPrefix { .. } => "strip_prefix",
            Filter::AddRequestHeader(_) => "add_request_header",
            Filter::AddResponseHeader(_) => "add_response_header",
            Filter::Authenticate(_) => "authenticate",
            Filter::RateLimit(_) => "rate_limit",
        }
    }

    /// Request phase. Runs before dispatch, in chain order.
    pub async fn on_request(&self, ctx: &mut RequestContext) -> FilterResult {
        match self {
            Filter::RequestId => trace::request_id_on_request(ctx),
            Filter::AccessLog => trace::access_log_on_request(ctx),
            Filter::Cors(policy) => policy.on_request(ctx),
            Filter::ResponseTiming => FilterResult::Continue,
            Filter::StripPrefix { parts } => headers::strip_prefix_on_request(*parts, ctx),
            Filter::AddRequestHeader(rule) => {
                rule.append_to_request(ctx);
                FilterResult::Continue
            }
            Filter::AddResponseHeader(_) => FilterResult::Continue,
            Filter::Authenticate(gate) => match gate.check(ctx) {
                Ok(()) => FilterResult::Continue,
                Err(e) => FilterResult::Reject(e),
            },
            Filter::RateLimit(rl) => rl.on_request(ctx).await,
        }
    }

    /// Response phase. Runs in reverse chain order, only for filters whose
    /// request phase ran.
    pub fn on_response(&self, ctx: &RequestContext, resp: &mut ResponseContext) {
        match self {
            Filter::RequestId => trace::request_id_on_response(ctx, resp),
            Filter::AccessLog => trace::access_log_on_response(ctx, resp),
            Filter::Cors(policy) => policy.on_response(ctx, resp),
            Filter::ResponseTiming => trace::timing_on_response(ctx, resp),
            Filter::AddResponseHeader(rule) => rule.append_to_response(ctx, resp),
            Filter::RateLimit(rl) => rl.on_response(ctx, resp),
            Filter::StripPrefix { .. } | Filter::AddRequestHeader(_) | Filter::Authenticate(_) => {}
        }
    }
}

/// Shared pieces needed to compile route filters.
pub struct FilterBuildContext<'a> {
    pub auth_gate: Arc<AuthGate>,
    pub rate_limit: &'a RateLimitConfig,
}

/// Build the global chain from its configured order. Called once per
/// config generation.
pub fn build_global_filters(
    kinds: &[GlobalFilterKind],
    cors: &CorsConfig,
) -> Result<Vec<Filter>, GatewayError> {
    let mut filters = Vec::with_capacity(kinds.len());
    for kind in kinds {
        filters.push(match kind {
            GlobalFilterKind::RequestId => Filter::RequestId,
            GlobalFilterKind::AccessLog => Filter::AccessLog,
            GlobalFilterKind::Cors => Filter::Cors(Arc::new(CorsPolicy::new(cors)?)),
            GlobalFilterKind::ResponseTiming => Filter::ResponseTiming,
        });
    }
    Ok(filters)
}

/// Build the filter list for one route, preserving declaration order.
///
/// Each `rate_limit` entry gets its own limiter, so buckets are isolated per
/// route and start full again after a reload.
pub fn build_route_filters(
    route: &RouteConfig,
    ctx: &FilterBuildContext<'_>,
) -> Result<Vec<Filter>, GatewayError> {
    let mut filters = Vec::with_capacity(route.filters.len());
    for cfg in &route.filters {
        filters.push(match cfg {
            FilterConfig::StripPrefix { parts } => Filter::StripPrefix { parts: *parts },
            FilterConfig::AddRequestHeader {
                name,
                value,
                computed,
            } => Filter::AddRequestHeader(HeaderRule::new(name, value.as_deref(), *computed)?),
            FilterConfig::AddResponseHeader {
                name,
                value,
                computed,
            } => Filter::AddResponseHeader(HeaderRule::new(name, value.as_deref(), *computed)?),
            FilterConfig::Authenticate => Filter::Authenticate(ctx.auth_gate.clone()),
            FilterConfig::RateLimit {
                capacity,
                refill_per_sec,
                key_strategies,
            } => {
                let mut settings = ctx.rate_limit.clone();
                if let Some(c) = capacity {
                    settings.capacity = *c;
                }
                if let Some(r) = refill_per_sec {
                    settings.refill_per_sec = *r;
                }
                if let Some(ref k) = key_strategies {
                    settings.key_strategies = k.clone();
                }
                Filter::RateLimit(Arc::new(RouteRateLimit::new(&route.id, &settings)?))
            }
        });
    }
    Ok(filters)
}
