use super::FilterResult;
use crate::proxy::context::{RequestContext, ResponseContext};
use http::{HeaderName, HeaderValue};
use std::time::{SystemTime, UNIX_EPOCH};

static X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");
static X_REQUEST_TIMESTAMP: HeaderName = HeaderName::from_static("x-request-timestamp");
static X_RESPONSE_TIME: HeaderName = HeaderName::from_static("x-response-time");

pub(super) fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(super) fn integer_header(n: u64) -> HeaderValue {
    let mut buf = itoa::Buffer::new();
    HeaderValue::from_str(buf.format(n)).unwrap_or_else(|_| HeaderValue::from_static("0"))
}

/// A fresh UUID per request, overwriting anything the client sent.
pub(super) fn request_id_on_request(ctx: &mut RequestContext) -> FilterResult {
    ctx.correlation_id = uuid::Uuid::new_v4().to_string();
    if let Ok(v) = HeaderValue::from_str(&ctx.correlation_id) {
        ctx.headers.insert(X_REQUEST_ID.clone(), v);
    }
    FilterResult::Continue
}

pub(super) fn request_id_on_response(ctx: &RequestContext, resp: &mut ResponseContext) {
    if let Ok(v) = HeaderValue::from_str(&ctx.correlation_id) {
        resp.headers.insert(X_REQUEST_ID.clone(), v);
    }
}

pub(super) fn access_log_on_request(ctx: &mut RequestContext) -> FilterResult {
    tracing::debug!(
        "access_log: incoming request, request_id={}, method={}, path={}, client_ip={}",
        ctx.correlation_id,
        ctx.method,
        ctx.inbound_path,
        ctx.client_ip
    );
    ctx.headers
        .insert(X_REQUEST_TIMESTAMP.clone(), integer_header(epoch_millis()));
    FilterResult::Continue
}

pub(super) fn access_log_on_response(ctx: &RequestContext, resp: &mut ResponseContext) {
    tracing::debug!(
        "access_log: outgoing response, request_id={}, status={}, duration_ms={}",
        ctx.correlation_id,
        resp.status.as_u16(),
        ctx.elapsed_millis()
    );
}

pub(super) fn timing_on_response(ctx: &RequestContext, resp: &mut ResponseContext) {
    resp.headers
        .insert(X_RESPONSE_TIME.clone(), integer_header(ctx.elapsed_millis()));
}
