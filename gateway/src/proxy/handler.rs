use super::chain::{declared_too_large, Fail, RouteDispatch};
use super::context::{BoxBody, RequestContext, ResponseContext};
use crate::error::GatewayError;
use crate::server::GatewayState;
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::net::SocketAddr;
use tracing::{debug, info};

/// Handle an incoming HTTP request:
///
/// 1. SNAPSHOT: load the current pipeline once; a reload mid-request does not affect it
/// 2. ROUTE: first matching route, or a failing terminal
/// 3. CHAIN: global + route filters around dispatch
/// 4. BODY: read by the dispatch terminal, only after every request filter passed
/// 5. LOG: access line and metrics
pub async fn handle_request(
    req: Request<Incoming>,
    state: GatewayState,
    peer_addr: SocketAddr,
) -> Result<Response<BoxBody>, hyper::Error> {
    let pipeline = state.pipeline.load_full();

    let (parts, body) = req.into_parts();
    let mut ctx = RequestContext::new(
        parts.method,
        parts.uri.path().to_string(),
        parts.uri.query().map(str::to_owned),
        parts.headers,
        peer_addr,
    );

    let route = pipeline.routes.match_route(&ctx);
    if let Some(ref r) = route {
        ctx.route_id = Some(r.id.clone());
    } else {
        debug!(
            "proxy: no route matched, method={}, path={}",
            ctx.method, ctx.inbound_path
        );
    }

    let too_large = declared_too_large(&ctx, pipeline.max_body_bytes);
    if too_large {
        debug!(
            "proxy: declared body too large, path={}, max={}",
            ctx.inbound_path, pipeline.max_body_bytes
        );
    }

    let resp = match route.as_deref() {
        Some(route) if too_large => {
            pipeline
                .chain
                .apply(&mut ctx, &route.filters, None, &Fail(GatewayError::PayloadTooLarge))
                .await
        }
        Some(route) => {
            let terminal = RouteDispatch::new(
                &pipeline.dispatcher,
                route,
                Some(body),
                pipeline.max_body_bytes,
            );
            pipeline
                .chain
                .apply(
                    &mut ctx,
                    &route.filters,
                    route.fallback.as_deref(),
                    &terminal,
                )
                .await
        }
        None => {
            pipeline
                .chain
                .apply(&mut ctx, &[], None, &Fail(GatewayError::RouteNotFound))
                .await
        }
    };

    log_request(&ctx, &resp, route.as_ref().map(|r| r.service.as_str()));
    Ok(resp.into_response())
}

fn log_request(ctx: &RequestContext, resp: &ResponseContext, service: Option<&str>) {
    let route = ctx.route_id.as_deref().unwrap_or("_no_route");
    let latency = ctx.received_at.elapsed();
    let status = resp.status.as_u16();

    info!(
        request_id = %ctx.correlation_id,
        client_ip = %ctx.client_ip,
        method = %ctx.method,
        path = %ctx.inbound_path,
        status,
        route,
        service = service.unwrap_or(""),
        latency_ms = latency.as_millis() as u64,
        "access"
    );

    let mut buf = itoa::Buffer::new();
    let status_code = buf.format(status).to_owned();
    metrics::counter!(
        "gateway_http_requests_total",
        "route" => route.to_owned(),
        "method" => ctx.method.as_str().to_owned(),
        "status_code" => status_code.clone(),
    )
    .increment(1);
    metrics::histogram!(
        "gateway_http_request_duration_seconds",
        "route" => route.to_owned(),
        "status_code" => status_code,
    )
    .record(latency.as_secs_f64());
}
