use super::FilterResult;
use crate::config::CorsConfig;
use crate::error::GatewayError;
use crate::proxy::context::{RequestContext, ResponseContext};
use globset::{Glob, GlobSet, GlobSetBuilder};
use http::header::{
    ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS, ACCESS_CONTROL_MAX_AGE,
    ACCESS_CONTROL_REQUEST_METHOD, ORIGIN, VARY,
};
use http::{HeaderValue, Method, StatusCode};

/// Compiled CORS settings. Header values are pre-rendered once per config
/// generation.
pub struct CorsPolicy {
    origins: GlobSet,
    allow_methods: HeaderValue,
    allow_headers: HeaderValue,
    expose_headers: Option<HeaderValue>,
    allow_credentials: bool,
    max_age: HeaderValue,
}

fn joined(items: &[String], what: &str) -> Result<HeaderValue, GatewayError> {
    HeaderValue::from_str(&items.join(", "))
        .map_err(|_| GatewayError::Config(format!("invalid cors {what}")))
}

impl CorsPolicy {
    pub fn new(cfg: &CorsConfig) -> Result<Self, GatewayError> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &cfg.allowed_origin_patterns {
            let glob = Glob::new(pattern).map_err(|e| {
                GatewayError::Config(format!("invalid cors origin pattern '{pattern}': {e}"))
            })?;
            builder.add(glob);
        }
        let origins = builder
            .build()
            .map_err(|e| GatewayError::Config(format!("cors origin patterns: {e}")))?;

        let expose_headers = if cfg.exposed_headers.is_empty() {
            None
        } else {
            Some(joined(&cfg.exposed_headers, "exposed headers")?)
        };

        let mut buf = itoa::Buffer::new();
        let max_age = HeaderValue::from_str(buf.format(cfg.max_age_secs))
            .map_err(|_| GatewayError::Config("invalid cors max age".to_string()))?;

        Ok(Self {
            origins,
            allow_methods: joined(&cfg.allowed_methods, "methods")?,
            allow_headers: joined(&cfg.allowed_headers, "headers")?,
            expose_headers,
            allow_credentials: cfg.allow_credentials,
            max_age,
        })
    }

    pub fn origin_allowed(&self, origin: &str) -> bool {
        self.origins.is_match(origin)
    }

    /// Allowed request origin, if the request is a CORS request at all.
    fn allowed_origin<'a>(&self, ctx: &'a RequestContext) -> Option<&'a HeaderValue> {
        let origin = ctx.headers.get(ORIGIN)?;
        let s = origin.to_str().ok()?;
        self.origin_allowed(s).then_some(origin)
    }

    /// Preflight requests are answered here and never reach a backend.
    pub(super) fn on_request(&self, ctx: &mut RequestContext) -> FilterResult {
        let is_preflight = ctx.method == Method::OPTIONS
            && ctx.headers.contains_key(ORIGIN)
            && ctx.headers.contains_key(ACCESS_CONTROL_REQUEST_METHOD);
        if !is_preflight {
            return FilterResult::Continue;
        }

        let Some(origin) = self.allowed_origin(ctx) else {
            tracing::debug!(
                "filter: cors: preflight from disallowed origin, request_id={}",
                ctx.correlation_id
            );
            return FilterResult::Respond(ResponseContext::new(StatusCode::FORBIDDEN));
        };

        let mut resp = ResponseContext::new(StatusCode::NO_CONTENT);
        resp.headers
            .insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        resp.headers
            .insert(ACCESS_CONTROL_ALLOW_METHODS, self.allow_methods.clone());
        resp.headers
            .insert(ACCESS_CONTROL_ALLOW_HEADERS, self.allow_headers.clone());
        resp.headers
            .insert(ACCESS_CONTROL_MAX_AGE, self.max_age.clone());
        FilterResult::Respond(resp)
    }

    pub(super) fn on_response(&self, ctx: &RequestContext, resp: &mut ResponseContext) {
        let Some(origin) = self.allowed_origin(ctx) else {
            return;
        };
        resp.headers
            .insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
        resp.headers.insert(VARY, HeaderValue::from_static("Origin"));
        if self.allow_credentials {
            resp.headers.insert(
                ACCESS_CONTROL_ALLOW_CREDENTIALS,
                HeaderValue::from_static("true"),
            );
        }
        if let Some(ref expose) = self.expose_headers {
            resp.headers
                .insert(ACCESS_CONTROL_EXPOSE_HEADERS, expose.clone());
        }
    }
}
