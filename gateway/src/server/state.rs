use crate::config::GatewayConfig;
use crate::dispatch::{build_http_client, Dispatcher, HttpClient, ServiceResolver, StaticDiscovery};
use crate::error::GatewayError;
use crate::metrics::Metrics;
use crate::proxy::fallback::FallbackCatalog;
use crate::proxy::filter::auth::{AuthGate, StaticTokenVerifier, TokenVerifier};
use crate::proxy::filter::FilterBuildContext;
use crate::proxy::FilterChain;
use crate::routing::{BuildContext, RouteTable};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Everything a request needs, compiled from one config generation.
///
/// Swapped as a unit, so a request never sees routes from one generation and
/// global filters or services from another.
pub struct Pipeline {
    pub routes: RouteTable,
    pub chain: FilterChain,
    pub dispatcher: Dispatcher,
    pub max_body_bytes: u64,
}

impl Pipeline {
    pub fn build(
        cfg: &GatewayConfig,
        client: HttpClient,
        collaborators: &Collaborators,
    ) -> Result<Self, GatewayError> {
        let resolver: Arc<dyn ServiceResolver> = match collaborators.resolver {
            Some(ref r) => r.clone(),
            None => Arc::new(StaticDiscovery::from_config(&cfg.services)),
        };
        let verifier: Arc<dyn TokenVerifier> = match collaborators.verifier {
            Some(ref v) => v.clone(),
            None => Arc::new(StaticTokenVerifier::new(&cfg.auth.tokens)),
        };

        let catalog = FallbackCatalog::new(&cfg.fallbacks);
        let build_ctx = BuildContext {
            filters: FilterBuildContext {
                auth_gate: Arc::new(AuthGate::new(&cfg.auth.public_paths, verifier)),
                rate_limit: &cfg.rate_limit,
            },
            fallbacks: &catalog,
            default_timeout_ms: cfg.default_timeout_ms,
        };

        Ok(Self {
            routes: RouteTable::new(&cfg.routes, &build_ctx)?,
            chain: FilterChain::new(&cfg.global_filters, &cfg.cors)?,
            dispatcher: Dispatcher::new(client, resolver),
            max_body_bytes: cfg.server.max_body_bytes,
        })
    }
}

/// External collaborators that replace the config-backed defaults. Kept
/// across reloads.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub resolver: Option<Arc<dyn ServiceResolver>>,
    pub verifier: Option<Arc<dyn TokenVerifier>>,
}

/// Shared gateway state, cheaply cloneable.
///
/// Reads go through `ArcSwap::load` and never block. Reloads are serialized
/// through `reload_mu`.
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<ArcSwap<GatewayConfig>>,
    pub pipeline: Arc<ArcSwap<Pipeline>>,
    pub metrics: Metrics,
    config_path: Option<PathBuf>,
    client: HttpClient,
    collaborators: Collaborators,
    reload_mu: Arc<Mutex<()>>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig, metrics: Metrics) -> Result<Self> {
        Self::with_collaborators(config, metrics, Collaborators::default())
    }

    pub fn with_collaborators(
        config: GatewayConfig,
        metrics: Metrics,
        collaborators: Collaborators,
    ) -> Result<Self> {
        config.validate()?;
        let client = build_http_client()?;
        let pipeline = Pipeline::build(&config, client.clone(), &collaborators)?;
        metrics::gauge!("gateway_config_routes_total").set(pipeline.routes.route_count() as f64);

        Ok(Self {
            config: Arc::new(ArcSwap::from_pointee(config)),
            pipeline: Arc::new(ArcSwap::from_pointee(pipeline)),
            metrics,
            config_path: None,
            client,
            collaborators,
            reload_mu: Arc::new(Mutex::new(())),
        })
    }

    /// Remember where the config came from so `reload` can re-read it.
    pub fn with_config_path(mut self, path: PathBuf) -> Self {
        self.config_path = Some(path);
        self
    }

    pub fn route_count(&self) -> usize {
        self.pipeline.load().routes.route_count()
    }

    pub fn resolver(&self) -> Arc<dyn ServiceResolver> {
        self.pipeline.load().dispatcher.resolver().clone()
    }

    /// Validate and compile `cfg`, then swap it in. On error the running
    /// pipeline is left untouched. Returns the new route count.
    pub async fn apply_config(&self, mut cfg: GatewayConfig) -> Result<usize> {
        let _guard = self.reload_mu.lock().await;
        cfg.validate()?;

        // Listen addresses are bound once at startup.
        let current = self.config.load();
        if cfg.server.listen != current.server.listen
            || cfg.server.admin_listen != current.server.admin_listen
        {
            warn!("config: listen address changes need a restart, keeping current");
        }
        cfg.server.listen = current.server.listen.clone();
        cfg.server.admin_listen = current.server.admin_listen.clone();

        let pipeline = Pipeline::build(&cfg, self.client.clone(), &self.collaborators)?;
        let routes = pipeline.routes.route_count();

        self.pipeline.store(Arc::new(pipeline));
        self.config.store(Arc::new(cfg));
        metrics::gauge!("gateway_config_routes_total").set(routes as f64);
        info!("config: applied, routes={}", routes);
        Ok(routes)
    }

    /// Re-read the config file and apply it.
    pub async fn reload(&self) -> Result<usize> {
        let result = match self.config_path {
            Some(ref path) => match GatewayConfig::load(path) {
                Ok(cfg) => self.apply_config(cfg).await,
                Err(e) => Err(e),
            },
            None => Err(anyhow::anyhow!("no config file to reload from")),
        };

        let label = if result.is_ok() { "success" } else { "error" };
        metrics::counter!("gateway_config_reloads_total", "result" => label).increment(1);
        if let Err(ref e) = result {
            warn!("config: reload rejected, keeping current routes, error={:#}", e);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;

    fn route(id: &str) -> RouteConfig {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "predicates": [{"type": "path", "pattern": format!("/{id}/**")}],
            "target_service": "svc"
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_apply_config_swaps_pipeline() {
        let mut cfg = GatewayConfig::default();
        cfg.routes.push(route("a"));
        let state = GatewayState::new(cfg, Metrics::detached()).unwrap();
        assert_eq!(state.route_count(), 1);

        let mut next = GatewayConfig::default();
        next.routes.push(route("a"));
        next.routes.push(route("b"));
        assert_eq!(state.apply_config(next).await.unwrap(), 2);
        assert_eq!(state.route_count(), 2);
        assert_eq!(state.config.load().routes.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_config_keeps_current() {
        let mut cfg = GatewayConfig::default();
        cfg.routes.push(route("a"));
        let state = GatewayState::new(cfg, Metrics::detached()).unwrap();

        let mut bad = GatewayConfig::default();
        bad.routes.push(route("dup"));
        bad.routes.push(route("dup"));
        assert!(state.apply_config(bad).await.is_err());
        assert_eq!(state.route_count(), 1);
    }

    #[tokio::test]
    async fn test_reload_without_path_fails() {
        let state = GatewayState::new(GatewayConfig::default(), Metrics::detached()).unwrap();
        assert!(state.reload().await.is_err());
    }

    #[tokio::test]
    async fn test_reload_from_file() {
        let path = std::env::temp_dir().join(format!("waypoint-reload-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            r#"
[[routes]]
id = "users"
target_service = "user-service"
predicates = [{ type = "path", pattern = "/api/users/**" }]
"#,
        )
        .unwrap();

        let state = GatewayState::new(GatewayConfig::default(), Metrics::detached())
            .unwrap()
            .with_config_path(path.clone());
        assert_eq!(state.route_count(), 0);
        assert_eq!(state.reload().await.unwrap(), 1);
        std::fs::remove_file(&path).ok();
    }
}
