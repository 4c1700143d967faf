use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use http_body_util::{BodyExt, Full};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

pub fn full_body(data: impl Into<Bytes>) -> BoxBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn empty_body() -> BoxBody {
    Full::new(Bytes::new())
        .map_err(|never| match never {})
        .boxed()
}

/// Per-request state threaded through the filter chain and the dispatcher.
///
/// Owned by exactly one request. Filters mutate `path` and `headers`, which
/// is what the dispatcher forwards; `inbound_path` keeps what the client sent.
pub struct RequestContext {
    pub method: Method,
    /// Path forwarded to the backend. Rewritten by `strip_prefix`.
    pub path: String,
    pub inbound_path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// TCP peer.
    pub remote_addr: SocketAddr,
    /// Left-most `X-Forwarded-For` entry when present, otherwise the peer IP.
    /// Client-controlled, so only logged. Policy keys use `remote_addr`.
    pub client_ip: IpAddr,
    /// Set by the `request_id` global filter.
    pub correlation_id: String,
    pub received_at: Instant,
    pub route_id: Option<String>,
    /// Tokens left in the bucket that admitted this request.
    pub rate_limit_remaining: Option<u64>,
}

impl RequestContext {
    pub fn new(
        method: Method,
        path: String,
        query: Option<String>,
        headers: HeaderMap,
        remote_addr: SocketAddr,
    ) -> Self {
        let client_ip = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
            .unwrap_or_else(|| remote_addr.ip());

        Self {
            method,
            inbound_path: path.clone(),
            path,
            query,
            headers,
            body: Bytes::new(),
            remote_addr,
            client_ip,
            correlation_id: String::new(),
            received_at: Instant::now(),
            route_id: None,
            rate_limit_remaining: None,
        }
    }

    /// Path plus query string as forwarded upstream.
    pub fn path_and_query(&self) -> String {
        match self.query {
            Some(ref q) if !q.is_empty() => {
                let mut s = String::with_capacity(self.path.len() + 1 + q.len());
                s.push_str(&self.path);
                s.push('?');
                s.push_str(q);
                s
            }
            _ => self.path.clone(),
        }
    }

    pub fn elapsed_millis(&self) -> u64 {
        self.received_at.elapsed().as_millis() as u64
    }
}

/// A fully buffered response on its way back to the client.
#[derive(Debug)]
pub struct ResponseContext {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub completed_at: Instant,
}

impl ResponseContext {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            completed_at: Instant::now(),
        }
    }

    pub fn json(status: StatusCode, body: impl Into<Bytes>) -> Self {
        let mut resp = Self::new(status);
        resp.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        resp.body = body.into();
        resp
    }

    pub fn into_response(self) -> hyper::Response<BoxBody> {
        let mut resp = hyper::Response::new(full_body(self.body));
        *resp.status_mut() = self.status;
        *resp.headers_mut() = self.headers;
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn peer() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7)), 40000)
    }

    #[test]
    fn test_request_context_new() {
        let ctx = RequestContext::new(
            Method::GET,
            "/api/v1".to_string(),
            None,
            HeaderMap::new(),
            peer(),
        );
        assert_eq!(ctx.path, "/api/v1");
        assert_eq!(ctx.inbound_path, "/api/v1");
        assert_eq!(ctx.client_ip, peer().ip());
        assert!(ctx.correlation_id.is_empty());
        assert!(ctx.route_id.is_none());
        assert!(ctx.body.is_empty());
    }

    #[test]
    fn test_client_ip_from_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        let ctx = RequestContext::new(Method::GET, "/".to_string(), None, headers, peer());
        assert_eq!(ctx.client_ip, "203.0.113.9".parse::<IpAddr>().unwrap());
        assert_eq!(ctx.remote_addr, peer());
    }

    #[test]
    fn test_path_and_query() {
        let mut ctx = RequestContext::new(
            Method::GET,
            "/users".to_string(),
            Some("page=2".to_string()),
            HeaderMap::new(),
            peer(),
        );
        assert_eq!(ctx.path_and_query(), "/users?page=2");
        ctx.query = Some(String::new());
        assert_eq!(ctx.path_and_query(), "/users");
    }

    #[test]
    fn test_response_json_into_response() {
        let resp = ResponseContext::json(StatusCode::NOT_FOUND, r#"{"error":"x"}"#);
        let resp = resp.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            resp.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
