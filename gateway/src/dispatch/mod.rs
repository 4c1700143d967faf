mod balancer;
pub mod discovery;

pub use discovery::{Endpoint, ResolveError, ServiceResolver, ServiceSummary, StaticDiscovery};

use crate::config::RetryConfig;
use crate::error::GatewayError;
use crate::proxy::context::{full_body, BoxBody, RequestContext, ResponseContext};
use http::header::{CONNECTION, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, HeaderName, HeaderValue, Request};
use http_body_util::BodyExt;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub type HttpClient = Client<HttpsConnector<HttpConnector>, BoxBody>;

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Build the shared outbound client. Plain `http://` goes straight through
/// the `HttpConnector`; `https://` is terminated with rustls against the
/// webpki roots. HTTP/2 is negotiated via ALPN for TLS backends only.
pub fn build_http_client() -> Result<HttpClient, GatewayError> {
    let mut http = HttpConnector::new();
    http.set_nodelay(true);
    http.set_keepalive(Some(POOL_IDLE_TIMEOUT));
    http.set_connect_timeout(Some(CONNECT_TIMEOUT));
    http.enforce_http(false);

    let https = hyper_rustls::HttpsConnectorBuilder::new()
        .with_provider_and_webpki_roots(rustls::crypto::ring::default_provider())
        .map_err(|e| GatewayError::Config(format!("tls setup failed: {e}")))?
        .https_or_http()
        .enable_http1()
        .enable_http2()
        .wrap_connector(http);

    Ok(Client::builder(TokioExecutor::new())
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build(https))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    ConnectFailed(String),
    Timeout,
    BackendError(u16),
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::ConnectFailed(reason) => write!(f, "connect failed: {}", reason),
            DispatchError::Timeout => write!(f, "timed out"),
            DispatchError::BackendError(status) => write!(f, "backend error status {}", status),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<DispatchError> for GatewayError {
    fn from(e: DispatchError) -> Self {
        match e {
            DispatchError::ConnectFailed(reason) => GatewayError::DispatchConnectFailed(reason),
            DispatchError::Timeout => GatewayError::DispatchTimeout,
            DispatchError::BackendError(status) => GatewayError::DispatchBackendError(status),
        }
    }
}

/// Forwards a filtered request to a resolved backend instance.
#[derive(Clone)]
pub struct Dispatcher {
    client: HttpClient,
    resolver: Arc<dyn ServiceResolver>,
}

impl Dispatcher {
    pub fn new(client: HttpClient, resolver: Arc<dyn ServiceResolver>) -> Self {
        Self { client, resolver }
    }

    pub fn resolver(&self) -> &Arc<dyn ServiceResolver> {
        &self.resolver
    }

    /// Without a retry policy this is exactly one attempt. With one, every
    /// attempt re-resolves the service and gets its own `timeout`.
    pub async fn dispatch(
        &self,
        service: &str,
        ctx: &RequestContext,
        timeout: Duration,
        retry: Option<&RetryConfig>,
    ) -> Result<ResponseContext, DispatchError> {
        let attempts = retry.map(|r| r.attempts.max(1)).unwrap_or(1);
        let mut attempt = 1;

        loop {
            let result = self.attempt_once(service, ctx, timeout).await;

            let retryable = match (retry, &result) {
                (None, _) => false,
                (Some(r), Err(DispatchError::ConnectFailed(_))) => r.on_connect_failure,
                (Some(r), Err(DispatchError::Timeout)) => r.on_timeout,
                (Some(_), Err(DispatchError::BackendError(_))) => false,
                (Some(r), Ok(resp)) => r.on_statuses.contains(&resp.status.as_u16()),
            };
            if !retryable {
                return result;
            }

            if attempt >= attempts {
                return match result {
                    Ok(resp) => Err(DispatchError::BackendError(resp.status.as_u16())),
                    Err(e) => Err(e),
                };
            }

            debug!(
                "dispatch: retrying, service={}, attempt={}, max={}, request_id={}, outcome={}",
                service,
                attempt,
                attempts,
                ctx.correlation_id,
                match result {
                    Ok(ref resp) => resp.status.as_u16().to_string(),
                    Err(ref e) => e.to_string(),
                }
            );
            metrics::counter!(
                "gateway_upstream_retries_total",
                "service" => service.to_string(),
            )
            .increment(1);
            attempt += 1;
        }
    }

    async fn attempt_once(
        &self,
        service: &str,
        ctx: &RequestContext,
        timeout: Duration,
    ) -> Result<ResponseContext, DispatchError> {
        let endpoint = self.resolver.resolve(service).map_err(|e| {
            warn!(
                "dispatch: resolve failed, service={}, request_id={}, error={}",
                service, ctx.correlation_id, e
            );
            DispatchError::ConnectFailed(e.to_string())
        })?;

        let authority = endpoint.authority();
        let mut uri = String::with_capacity(
            endpoint.scheme.len() + 3 + authority.len() + ctx.path.len() + 16,
        );
        uri.push_str(&endpoint.scheme);
        uri.push_str("://");
        uri.push_str(&authority);
        uri.push_str(&ctx.path_and_query());

        let mut headers = ctx.headers.clone();
        let original_host = headers
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        remove_hop_headers(&mut headers);
        inject_forwarded_headers(&mut headers, ctx, original_host.as_deref());
        if let Ok(v) = HeaderValue::from_str(&authority) {
            headers.insert(HOST, v);
        }

        let mut req = Request::builder()
            .method(ctx.method.clone())
            .uri(&uri)
            .body(full_body(ctx.body.clone()))
            .map_err(|e| DispatchError::ConnectFailed(format!("invalid upstream request: {e}")))?;
        *req.headers_mut() = headers;

        let start = Instant::now();
        let exchange = async {
            let resp = self.client.request(req).await.map_err(|e| {
                debug!(
                    "dispatch: upstream request failed, service={}, upstream={}, error={}",
                    service, authority, e
                );
                DispatchError::ConnectFailed(e.to_string())
            })?;
            let (parts, body) = resp.into_parts();
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    warn!(
                        "dispatch: failed reading upstream body, service={}, upstream={}, error={}",
                        service, authority, e
                    );
                    return Err(DispatchError::BackendError(502));
                }
            };
            Ok::<_, DispatchError>((parts, body))
        };

        let outcome = match tokio::time::timeout(timeout, exchange).await {
            Ok(r) => r,
            Err(_) => {
                warn!(
                    "dispatch: upstream timeout, service={}, upstream={}, timeout_ms={}, request_id={}",
                    service,
                    authority,
                    timeout.as_millis(),
                    ctx.correlation_id
                );
                Err(DispatchError::Timeout)
            }
        };

        let status_label = match outcome {
            Ok((ref parts, _)) => parts.status.as_u16().to_string(),
            Err(DispatchError::Timeout) => "timeout".to_string(),
            Err(_) => "error".to_string(),
        };
        metrics::histogram!(
            "gateway_upstream_request_duration_seconds",
            "service" => service.to_string(),
            "status" => status_label,
        )
        .record(start.elapsed().as_secs_f64());

        let (parts, body) = outcome?;
        let mut resp = ResponseContext::new(parts.status);
        resp.headers = parts.headers;
        remove_hop_headers(&mut resp.headers);
        resp.body = body;
        Ok(resp)
    }
}

fn remove_hop_headers(headers: &mut HeaderMap) {
    static HOP_HEADERS: [HeaderName; 8] = [
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for h in &HOP_HEADERS {
        headers.remove(h);
    }
}

/// `X-Forwarded-For` gets the TCP peer appended; `X-Forwarded-Proto` is only
/// defaulted; `X-Real-IP` is always the immediate peer.
fn inject_forwarded_headers(
    headers: &mut HeaderMap,
    ctx: &RequestContext,
    original_host: Option<&str>,
) {
    static XFF: HeaderName = HeaderName::from_static("x-forwarded-for");
    static XFP: HeaderName = HeaderName::from_static("x-forwarded-proto");
    static XFH: HeaderName = HeaderName::from_static("x-forwarded-host");
    static XRI: HeaderName = HeaderName::from_static("x-real-ip");

    let peer_ip = ctx.remote_addr.ip().to_string();

    let xff = match headers.get(&XFF).and_then(|v| v.to_str().ok()) {
        Some(existing) => format!("{existing}, {peer_ip}"),
        None => peer_ip.clone(),
    };
    if let Ok(v) = HeaderValue::from_str(&xff) {
        headers.insert(XFF.clone(), v);
    }

    if !headers.contains_key(&XFP) {
        headers.insert(XFP.clone(), HeaderValue::from_static("http"));
    }

    if let Some(v) = original_host.and_then(|h| HeaderValue::from_str(h).ok()) {
        headers.insert(XFH.clone(), v);
    }

    if let Ok(v) = HeaderValue::from_str(&peer_ip) {
        headers.insert(XRI.clone(), v);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx(headers: HeaderMap) -> RequestContext {
        RequestContext::new(
            Method::GET,
            "/users/1".to_string(),
            Some("page=2".to_string()),
            headers,
            "10.1.2.3:5000".parse().unwrap(),
        )
    }

    #[test]
    fn test_forwarded_headers_append_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9"));
        let c = ctx(headers.clone());
        inject_forwarded_headers(&mut headers, &c, Some("api.example.com"));
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "203.0.113.9, 10.1.2.3");
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "http");
        assert_eq!(headers.get("x-forwarded-host").unwrap(), "api.example.com");
        assert_eq!(headers.get("x-real-ip").unwrap(), "10.1.2.3");
    }

    #[test]
    fn test_forwarded_proto_kept() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-proto", HeaderValue::from_static("https"));
        let c = ctx(headers.clone());
        inject_forwarded_headers(&mut headers, &c, None);
        assert_eq!(headers.get("x-forwarded-proto").unwrap(), "https");
        assert_eq!(headers.get("x-forwarded-for").unwrap(), "10.1.2.3");
        assert!(!headers.contains_key("x-forwarded-host"));
    }

    #[test]
    fn test_remove_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("x-keep", HeaderValue::from_static("1"));
        remove_hop_headers(&mut headers);
        assert_eq!(headers.len(), 1);
        assert!(headers.contains_key("x-keep"));
    }

    #[test]
    fn test_dispatch_error_into_gateway_error() {
        assert_eq!(
            GatewayError::from(DispatchError::Timeout),
            GatewayError::DispatchTimeout
        );
        assert_eq!(
            GatewayError::from(DispatchError::BackendError(503)),
            GatewayError::DispatchBackendError(503)
        );
    }

    struct CountingResolver {
        calls: AtomicUsize,
        port: u16,
    }

    impl ServiceResolver for CountingResolver {
        fn resolve(&self, service: &str) -> Result<Endpoint, ResolveError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if service == "missing" {
                return Err(ResolveError::UnknownService(service.to_string()));
            }
            Ok(Endpoint {
                scheme: "http".to_string(),
                host: "127.0.0.1".to_string(),
                port: self.port,
            })
        }

        fn list_services(&self) -> Vec<ServiceSummary> {
            Vec::new()
        }
    }

    fn dispatcher(port: u16) -> (Dispatcher, Arc<CountingResolver>) {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
            port,
        });
        (
            Dispatcher::new(build_http_client().unwrap(), resolver.clone()),
            resolver,
        )
    }

    #[tokio::test]
    async fn test_resolve_failure_is_connect_failed() {
        let (d, _) = dispatcher(1);
        let res = d
            .dispatch("missing", &ctx(HeaderMap::new()), Duration::from_secs(1), None)
            .await;
        assert!(matches!(res, Err(DispatchError::ConnectFailed(ref m)) if m.contains("missing")));
    }

    #[tokio::test]
    async fn test_retry_on_connect_failure_reresolves() {
        // Port 1 on loopback refuses connections.
        let (d, resolver) = dispatcher(1);
        let retry = RetryConfig {
            attempts: 3,
            on_connect_failure: true,
            on_timeout: true,
            on_statuses: vec![503],
        };
        let res = d
            .dispatch(
                "svc",
                &ctx(HeaderMap::new()),
                Duration::from_secs(2),
                Some(&retry),
            )
            .await;
        assert!(matches!(res, Err(DispatchError::ConnectFailed(_))));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_retry_policy_is_single_attempt() {
        let (d, resolver) = dispatcher(1);
        let res = d
            .dispatch("svc", &ctx(HeaderMap::new()), Duration::from_secs(2), None)
            .await;
        assert!(matches!(res, Err(DispatchError::ConnectFailed(_))));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }
}
