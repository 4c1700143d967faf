pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::collections::HashSet;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides for infrastructure settings. When the file does not
    /// exist, built-in defaults are used and the gateway starts with an
    /// empty route table and answers every request with 404.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            Self::parse(&content, path)?
        } else {
            tracing::info!("config file not found at {}, using defaults", path.display());
            GatewayConfig::default()
        };

        config.apply_env_overrides();

        config.validate()?;
        tracing::info!(
            routes = config.routes.len(),
            services = config.services.len(),
            "loaded gateway configuration"
        );
        Ok(config)
    }

    fn parse(content: &str, path: &Path) -> Result<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Ok(toml::from_str(content)?),
            Some("json") => Ok(serde_json::from_str(content)?),
            Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
            None => anyhow::bail!("config file has no extension, use .toml or .json"),
        }
    }

    /// Environment overrides cover listen addresses and limiter/timeout
    /// defaults. Routes and services come from the config file only.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("WAYPOINT_LISTEN") {
            self.server.listen = v;
        }
        if let Ok(v) = std::env::var("WAYPOINT_ADMIN_LISTEN") {
            self.server.admin_listen = v;
        }
        if let Ok(v) = std::env::var("WAYPOINT_RATE_LIMIT_CAPACITY") {
            if let Ok(n) = v.parse::<f64>() {
                self.rate_limit.capacity = n;
            }
        }
        if let Ok(v) = std::env::var("WAYPOINT_RATE_LIMIT_REFILL_PER_SEC") {
            if let Ok(n) = v.parse::<f64>() {
                self.rate_limit.refill_per_sec = n;
            }
        }
        if let Ok(v) = std::env::var("WAYPOINT_DEFAULT_TIMEOUT_MS") {
            if let Ok(n) = v.parse::<u64>() {
                self.default_timeout_ms = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self.global_filters.first() {
            Some(GlobalFilterKind::RequestId) => {}
            _ => anyhow::bail!("global_filters must start with 'request_id'"),
        }
        let mut seen_globals = HashSet::new();
        for kind in &self.global_filters {
            if !seen_globals.insert(*kind) {
                anyhow::bail!("global filter {:?} listed more than once", kind);
            }
        }

        if self.default_timeout_ms == 0 {
            anyhow::bail!("default_timeout_ms must be greater than 0");
        }

        validate_bucket("rate_limit", self.rate_limit.capacity, self.rate_limit.refill_per_sec)?;
        if self.rate_limit.key_strategies.is_empty() {
            anyhow::bail!("rate_limit.key_strategies must not be empty");
        }

        for pattern in &self.cors.allowed_origin_patterns {
            globset::Glob::new(pattern)
                .map_err(|e| anyhow::anyhow!("invalid cors origin pattern '{}': {}", pattern, e))?;
        }

        let mut service_names = HashSet::new();
        for svc in &self.services {
            if svc.name.is_empty() {
                anyhow::bail!("service with empty name");
            }
            if !service_names.insert(svc.name.as_str()) {
                anyhow::bail!("service '{}' declared more than once", svc.name);
            }
            if svc.scheme != "http" && svc.scheme != "https" {
                anyhow::bail!("service '{}' has unsupported scheme '{}'", svc.name, svc.scheme);
            }
        }

        let mut fallback_ids: HashSet<String> =
            builtin_fallbacks().into_iter().map(|f| f.id).collect();
        fallback_ids.extend(self.fallbacks.iter().map(|f| f.id.clone()));

        let mut route_ids = HashSet::new();
        for route in &self.routes {
            if route.id.is_empty() {
                anyhow::bail!("route with empty id");
            }
            if !route_ids.insert(route.id.as_str()) {
                anyhow::bail!("route id '{}' declared more than once", route.id);
            }
            if route.service_name().is_empty() {
                anyhow::bail!("route '{}' has empty target_service", route.id);
            }
            // A gateway without static services delegates resolution to an
            // external resolver, so unknown names are only an error here.
            if !self.services.is_empty() && !service_names.contains(route.service_name()) {
                anyhow::bail!(
                    "route '{}' references unknown service '{}'",
                    route.id,
                    route.service_name()
                );
            }
            if let Some(ref fb) = route.fallback {
                if !fallback_ids.contains(fb) {
                    anyhow::bail!("route '{}' references unknown fallback '{}'", route.id, fb);
                }
            }
            if route.timeout_ms == Some(0) {
                anyhow::bail!("route '{}': timeout_ms must be greater than 0", route.id);
            }
            if let Some(ref retry) = route.retry {
                if retry.attempts == 0 {
                    anyhow::bail!("route '{}': retry.attempts must be at least 1", route.id);
                }
            }
            for pred in &route.predicates {
                validate_predicate(&route.id, pred)?;
            }
            for filter in &route.filters {
                validate_filter(&route.id, filter, &self.rate_limit)?;
            }
        }

        for route_id in self.unverified_user_keys() {
            tracing::warn!(
                "config: rate_limit keys on X-User-Id before authenticate, client can rotate it, route={}",
                route_id
            );
        }
        Ok(())
    }

    /// Routes whose `rate_limit` may key on `X-User-Id` while it still holds
    /// the client-sent value, i.e. before an `authenticate` filter overwrote it.
    pub fn unverified_user_keys(&self) -> Vec<&str> {
        self.routes
            .iter()
            .filter(|route| {
                let mut authenticated = false;
                route.filters.iter().any(|filter| match filter {
                    FilterConfig::Authenticate => {
                        authenticated = true;
                        false
                    }
                    FilterConfig::RateLimit { key_strategies, .. } => {
                        !authenticated
                            && key_strategies
                                .as_ref()
                                .unwrap_or(&self.rate_limit.key_strategies)
                                .contains(&KeyStrategy::UserId)
                    }
                    _ => false,
                })
            })
            .map(|route| route.id.as_str())
            .collect()
    }
}

fn validate_bucket(scope: &str, capacity: f64, refill: f64) -> Result<()> {
    if !(capacity.is_finite() && capacity > 0.0) {
        anyhow::bail!("{scope}: capacity must be a positive number");
    }
    if !(refill.is_finite() && refill > 0.0) {
        anyhow::bail!("{scope}: refill_per_sec must be a positive number");
    }
    Ok(())
}

fn validate_predicate(route_id: &str, pred: &PredicateConfig) -> Result<()> {
    match pred {
        PredicateConfig::Path { pattern } => {
            if !pattern.starts_with('/') {
                anyhow::bail!("route '{}': path pattern '{}' must start with '/'", route_id, pattern);
            }
            let literal = pattern.strip_suffix("/**").unwrap_or(pattern.as_str());
            if literal.contains('*') {
                anyhow::bail!(
                    "route '{}': path pattern '{}' may only use a single trailing '/**'",
                    route_id,
                    pattern
                );
            }
        }
        PredicateConfig::Method { methods } => {
            if methods.is_empty() {
                anyhow::bail!("route '{}': method predicate with no methods", route_id);
            }
        }
        PredicateConfig::Header { name, regex } => {
            http::HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                anyhow::anyhow!("route '{}': invalid header name '{}'", route_id, name)
            })?;
            regex::Regex::new(regex).map_err(|e| {
                anyhow::anyhow!("route '{}': invalid header regex '{}': {}", route_id, regex, e)
            })?;
        }
    }
    Ok(())
}

fn validate_filter(route_id: &str, filter: &FilterConfig, defaults: &RateLimitConfig) -> Result<()> {
    match filter {
        FilterConfig::AddRequestHeader {
            name,
            value,
            computed,
        }
        | FilterConfig::AddResponseHeader {
            name,
            value,
            computed,
        } => {
            http::HeaderName::from_bytes(name.as_bytes()).map_err(|_| {
                anyhow::anyhow!("route '{}': invalid header name '{}'", route_id, name)
            })?;
            match (value, computed) {
                (Some(v), None) => {
                    http::HeaderValue::from_str(v).map_err(|_| {
                        anyhow::anyhow!("route '{}': invalid value for header '{}'", route_id, name)
                    })?;
                }
                (None, Some(_)) => {}
                _ => anyhow::bail!(
                    "route '{}': header '{}' needs exactly one of 'value' or 'computed'",
                    route_id,
                    name
                ),
            }
        }
        FilterConfig::RateLimit {
            capacity,
            refill_per_sec,
            key_strategies,
        } => {
            validate_bucket(
                &format!("route '{route_id}' rate_limit"),
                capacity.unwrap_or(defaults.capacity),
                refill_per_sec.unwrap_or(defaults.refill_per_sec),
            )?;
            if key_strategies.as_ref().is_some_and(|k| k.is_empty()) {
                anyhow::bail!("route '{}': rate_limit key_strategies must not be empty", route_id);
            }
        }
        FilterConfig::StripPrefix { .. } | FilterConfig::Authenticate => {}
    }
    Ok(())
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            rate_limit: RateLimitConfig::default(),
            cors: CorsConfig::default(),
            global_filters: types::default_global_filters(),
            default_timeout_ms: types::default_timeout_ms(),
            services: Vec::new(),
            fallbacks: Vec::new(),
            routes: Vec::new(),
        }
    }
}
