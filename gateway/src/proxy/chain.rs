use super::context::{RequestContext, ResponseContext};
use super::fallback::{normalize, FallbackPayload};
use super::filter::{build_global_filters, Filter, FilterResult};
use crate::config::{CorsConfig, GlobalFilterKind};
use crate::dispatch::Dispatcher;
use crate::error::GatewayError;
use crate::routing::CompiledRoute;
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::header::CONTENT_LENGTH;
use http_body_util::{BodyExt, Limited};
use hyper::body::Incoming;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

/// The innermost step of the chain, reached only when every request phase
/// returned `Continue`.
pub trait Terminal: Send + Sync {
    fn call<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<ResponseContext, GatewayError>>;
}

/// Forward to the matched route's backend service.
///
/// The request body is collected here, once every request filter has
/// passed, so rejected requests never have their body buffered.
pub struct RouteDispatch<'r> {
    dispatcher: &'r Dispatcher,
    route: &'r CompiledRoute,
    body: Mutex<Option<Incoming>>,
    max_body_bytes: u64,
}

impl<'r> RouteDispatch<'r> {
    pub fn new(
        dispatcher: &'r Dispatcher,
        route: &'r CompiledRoute,
        body: Option<Incoming>,
        max_body_bytes: u64,
    ) -> Self {
        Self {
            dispatcher,
            route,
            body: Mutex::new(body),
            max_body_bytes,
        }
    }
}

impl Terminal for RouteDispatch<'_> {
    fn call<'a>(
        &'a self,
        ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<ResponseContext, GatewayError>> {
        Box::pin(async move {
            let body = self
                .body
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(body) = body {
                ctx.body = read_body(body, self.max_body_bytes).await?;
            }
            self.dispatcher
                .dispatch(
                    &self.route.service,
                    ctx,
                    self.route.timeout,
                    self.route.retry.as_ref(),
                )
                .await
                .map_err(GatewayError::from)
        })
    }
}

/// `Content-Length` above the limit, checked before any filter runs.
pub fn declared_too_large(ctx: &RequestContext, max_bytes: u64) -> bool {
    ctx.headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .is_some_and(|cl| cl > max_bytes)
}

/// Collect at most `max_bytes`; chunked bodies are cut off at the same limit.
async fn read_body(body: Incoming, max_bytes: u64) -> Result<Bytes, GatewayError> {
    let limit = usize::try_from(max_bytes).unwrap_or(usize::MAX);
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) => {
            if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                tracing::debug!("chain: buffered body too large, max={}", max_bytes);
                Err(GatewayError::PayloadTooLarge)
            } else {
                tracing::debug!("chain: failed to read request body, error={}", e);
                Err(GatewayError::Unexpected(format!("request body: {e}")))
            }
        }
    }
}

/// Terminal for requests that are already known to fail (no route matched,
/// declared body too large). The global filters still run around it, so the error
/// response carries a request id.
pub struct Fail(pub GatewayError);

impl Terminal for Fail {
    fn call<'a>(
        &'a self,
        _ctx: &'a mut RequestContext,
    ) -> BoxFuture<'a, Result<ResponseContext, GatewayError>> {
        let err = self.0.clone();
        Box::pin(async move { Err(err) })
    }
}

/// Global filters plus the run loop shared by every route.
pub struct FilterChain {
    global: Vec<Filter>,
}

impl FilterChain {
    pub fn new(kinds: &[GlobalFilterKind], cors: &CorsConfig) -> Result<Self, GatewayError> {
        Ok(Self {
            global: build_global_filters(kinds, cors)?,
        })
    }

    pub fn global_filters(&self) -> &[Filter] {
        &self.global
    }

    /// Run global filters, then `route_filters`, then `terminal`, then the
    /// response phases in reverse. Never fails: every error and any panic
    /// inside the pipeline is turned into a response.
    pub async fn apply(
        &self,
        ctx: &mut RequestContext,
        route_filters: &[Filter],
        fallback: Option<&FallbackPayload>,
        terminal: &dyn Terminal,
    ) -> ResponseContext {
        let entered = AtomicUsize::new(0);
        let outcome = AssertUnwindSafe(self.run(ctx, route_filters, fallback, terminal, &entered))
            .catch_unwind()
            .await;

        match outcome {
            Ok(resp) => resp,
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic".to_string());
                tracing::error!(
                    "chain: panic in request pipeline, request_id={}, error={}",
                    ctx.correlation_id,
                    msg
                );
                let mut resp = normalize(&GatewayError::Unexpected(msg), ctx, None);
                let globals = entered.load(Ordering::Relaxed).min(self.global.len());
                let headers = std::panic::catch_unwind(AssertUnwindSafe(|| {
                    for filter in self.global[..globals].iter().rev() {
                        filter.on_response(ctx, &mut resp);
                    }
                }));
                if headers.is_err() {
                    tracing::error!(
                        "chain: panic in response phase, request_id={}",
                        ctx.correlation_id
                    );
                }
                resp.completed_at = Instant::now();
                resp
            }
        }
    }

    async fn run(
        &self,
        ctx: &mut RequestContext,
        route_filters: &[Filter],
        fallback: Option<&FallbackPayload>,
        terminal: &dyn Terminal,
        progress: &AtomicUsize,
    ) -> ResponseContext {
        let filters: Vec<&Filter> = self.global.iter().chain(route_filters).collect();

        // Number of filters whose request phase ran, including a short-circuiting one.
        let mut entered = 0;
        let mut short_circuit = None;

        for filter in &filters {
            entered += 1;
            progress.store(entered, Ordering::Relaxed);
            match filter.on_request(ctx).await {
                FilterResult::Continue => {}
                FilterResult::Respond(resp) => {
                    short_circuit = Some(resp);
                    break;
                }
                FilterResult::Reject(err) => {
                    tracing::debug!(
                        "chain: short-circuit, filter={}, request_id={}, error={}",
                        filter.name(),
                        ctx.correlation_id,
                        err
                    );
                    short_circuit = Some(normalize(&err, ctx, None));
                    break;
                }
            }
        }

        let mut resp = match short_circuit {
            Some(resp) => resp,
            None => match terminal.call(ctx).await {
                Ok(resp) => resp,
                Err(err) => {
                    let fb = fallback.filter(|_| err.is_backend_unreachable());
                    normalize(&err, ctx, fb)
                }
            },
        };

        for filter in filters[..entered].iter().rev() {
            filter.on_response(ctx, &mut resp);
        }
        resp.completed_at = Instant::now();
        resp
    }
}
