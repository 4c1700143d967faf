use crate::config::{builtin_fallbacks, FallbackConfig};
use crate::error::GatewayError;
use crate::proxy::context::{RequestContext, ResponseContext};
use http::StatusCode;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

/// Canned body answered in place of an unreachable backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackPayload {
    pub service: String,
    pub message: String,
    pub suggestion: String,
}

impl From<&FallbackConfig> for FallbackPayload {
    fn from(cfg: &FallbackConfig) -> Self {
        Self {
            service: cfg.service.clone(),
            message: cfg.message.clone(),
            suggestion: cfg.suggestion.clone(),
        }
    }
}

/// Built-in payloads overlaid with the configured ones, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct FallbackCatalog {
    entries: HashMap<String, Arc<FallbackPayload>>,
}

impl FallbackCatalog {
    pub fn new(configured: &[FallbackConfig]) -> Self {
        let entries = builtin_fallbacks()
            .iter()
            .chain(configured)
            .map(|f| (f.id.clone(), Arc::new(FallbackPayload::from(f))))
            .collect();
        Self { entries }
    }

    pub fn get(&self, id: &str) -> Option<Arc<FallbackPayload>> {
        self.entries.get(id).cloned()
    }
}

#[derive(Serialize)]
struct ErrorEnvelope<'a> {
    error: &'a str,
    status: u16,
    timestamp: String,
    path: &'a str,
    #[serde(rename = "requestId")]
    request_id: &'a str,
}

#[derive(Serialize)]
struct FallbackEnvelope<'a> {
    message: &'a str,
    service: &'a str,
    status: &'static str,
    timestamp: String,
    suggestion: &'a str,
}

pub fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::RouteNotFound => StatusCode::NOT_FOUND,
        GatewayError::AuthMissing | GatewayError::AuthInvalid(_) => StatusCode::UNAUTHORIZED,
        GatewayError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::StripPrefixOutOfRange { .. } => StatusCode::BAD_REQUEST,
        GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
        GatewayError::DispatchConnectFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
        GatewayError::DispatchTimeout => StatusCode::REQUEST_TIMEOUT,
        GatewayError::DispatchBackendError(_)
        | GatewayError::Unexpected(_)
        | GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Client-facing message. Internal reasons (connect errors, panic text)
/// stay in the logs.
fn client_message(err: &GatewayError) -> String {
    match err {
        GatewayError::RouteNotFound => "No route found for request".to_string(),
        GatewayError::AuthMissing => "Missing Authorization header".to_string(),
        GatewayError::AuthInvalid(reason) => reason.clone(),
        GatewayError::RateLimited => "Too many requests".to_string(),
        GatewayError::StripPrefixOutOfRange { .. } => err.to_string(),
        GatewayError::PayloadTooLarge => "Payload too large".to_string(),
        GatewayError::DispatchConnectFailed(_) => "Service temporarily unavailable".to_string(),
        GatewayError::DispatchTimeout => "Request timeout".to_string(),
        GatewayError::DispatchBackendError(_)
        | GatewayError::Unexpected(_)
        | GatewayError::Config(_) => "Internal server error".to_string(),
    }
}

fn now_rfc3339() -> String {
    humantime::format_rfc3339_millis(SystemTime::now()).to_string()
}

/// Turn any pipeline failure into a client response. Never fails.
///
/// `fallback` is only honoured for errors where the backend could not be
/// reached; every other error gets the JSON error envelope.
pub fn normalize(
    err: &GatewayError,
    ctx: &RequestContext,
    fallback: Option<&FallbackPayload>,
) -> ResponseContext {
    if let Some(fb) = fallback.filter(|_| err.is_backend_unreachable()) {
        tracing::warn!(
            "fallback: serving canned payload, service={}, request_id={}, error={}",
            fb.service,
            ctx.correlation_id,
            err
        );
        metrics::counter!(
            "gateway_fallback_total",
            "service" => fb.service.clone(),
        )
        .increment(1);

        let envelope = FallbackEnvelope {
            message: &fb.message,
            service: &fb.service,
            status: "fallback",
            timestamp: now_rfc3339(),
            suggestion: &fb.suggestion,
        };
        let body = serde_json::to_vec(&envelope).unwrap_or_default();
        return ResponseContext::json(StatusCode::SERVICE_UNAVAILABLE, body);
    }

    let status = status_for(err);
    if status.is_server_error() {
        tracing::warn!(
            "fallback: request failed, path={}, request_id={}, error={}",
            ctx.inbound_path,
            ctx.correlation_id,
            err
        );
    } else {
        tracing::debug!(
            "fallback: request rejected, path={}, request_id={}, error={}",
            ctx.inbound_path,
            ctx.correlation_id,
            err
        );
    }

    let message = client_message(err);
    let envelope = ErrorEnvelope {
        error: &message,
        status: status.as_u16(),
        timestamp: now_rfc3339(),
        path: &ctx.inbound_path,
        request_id: &ctx.correlation_id,
    };
    let body = serde_json::to_vec(&envelope).unwrap_or_default();
    ResponseContext::json(status, body)
}
