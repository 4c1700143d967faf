use super::trace::{epoch_millis, integer_header};
use super::FilterResult;
use crate::config::ComputedValue;
use crate::error::GatewayError;
use crate::proxy::context::{RequestContext, ResponseContext};
use http::{HeaderName, HeaderValue};

/// Drop the first `parts` path segments. Removing every segment forwards `/`.
pub(super) fn strip_prefix_on_request(parts: usize, ctx: &mut RequestContext) -> FilterResult {
    match strip_segments(&ctx.path, parts) {
        Ok(path) => {
            tracing::debug!(
                "filter: strip_prefix: rewrote path, from={}, to={}, request_id={}",
                ctx.path,
                path,
                ctx.correlation_id
            );
            ctx.path = path;
            FilterResult::Continue
        }
        Err(e) => FilterResult::Reject(e),
    }
}

pub fn strip_segments(path: &str, parts: usize) -> Result<String, GatewayError> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if parts > segments.len() {
        return Err(GatewayError::StripPrefixOutOfRange {
            requested: parts,
            available: segments.len(),
        });
    }
    let rest = &segments[parts..];
    let mut out = String::with_capacity(path.len());
    for seg in rest {
        out.push('/');
        out.push_str(seg);
    }
    if out.is_empty() {
        out.push('/');
    } else if path.ends_with('/') {
        out.push('/');
    }
    Ok(out)
}

#[derive(Debug, Clone)]
enum HeaderSource {
    Static(HeaderValue),
    Computed(ComputedValue),
}

/// A header added by `add_request_header` / `add_response_header`.
#[derive(Debug, Clone)]
pub struct HeaderRule {
    pub name: HeaderName,
    source: HeaderSource,
}

impl HeaderRule {
    pub fn new(
        name: &str,
        value: Option<&str>,
        computed: Option<ComputedValue>,
    ) -> Result<Self, GatewayError> {
        let header = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| GatewayError::Config(format!("invalid header name '{name}'")))?;
        let source = match (value, computed) {
            (Some(v), None) => HeaderSource::Static(HeaderValue::from_str(v).map_err(|_| {
                GatewayError::Config(format!("invalid value for header '{name}'"))
            })?),
            (None, Some(c)) => HeaderSource::Computed(c),
            _ => {
                return Err(GatewayError::Config(format!(
                    "header '{name}' needs exactly one of value or computed"
                )))
            }
        };
        Ok(Self {
            name: header,
            source,
        })
    }

    pub fn is_computed(&self, kind: ComputedValue) -> bool {
        matches!(self.source, HeaderSource::Computed(c) if c == kind)
    }

    fn value(&self, ctx: &RequestContext) -> Option<HeaderValue> {
        match self.source {
            HeaderSource::Static(ref v) => Some(v.clone()),
            HeaderSource::Computed(ComputedValue::RequestId) => {
                HeaderValue::from_str(&ctx.correlation_id).ok()
            }
            HeaderSource::Computed(ComputedValue::ElapsedMillis) => {
                Some(integer_header(ctx.elapsed_millis()))
            }
            HeaderSource::Computed(ComputedValue::EpochMillis) => {
                Some(integer_header(epoch_millis()))
            }
        }
    }

    pub(super) fn append_to_request(&self, ctx: &mut RequestContext) {
        if let Some(v) = self.value(ctx) {
            ctx.headers.append(self.name.clone(), v);
        }
    }

    pub(super) fn append_to_response(&self, ctx: &RequestContext, resp: &mut ResponseContext) {
        if let Some(v) = self.value(ctx) {
            resp.headers.append(self.name.clone(), v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method, StatusCode};

    fn ctx(path: &str) -> RequestContext {
        RequestContext::new(
            Method::POST,
            path.to_string(),
            None,
            HeaderMap::new(),
            "127.0.0.1:9000".parse().unwrap(),
        )
    }

    #[test]
    fn test_strip_two_segments() {
        assert_eq!(strip_segments("/api/auth/login", 2).unwrap(), "/login");
        assert_eq!(strip_segments("/api/auth/a/b", 2).unwrap(), "/a/b");
    }

    #[test]
    fn test_strip_all_segments_forwards_root() {
        assert_eq!(strip_segments("/api/auth", 2).unwrap(), "/");
    }

    #[test]
    fn test_strip_zero_is_noop() {
        assert_eq!(strip_segments("/api/x", 0).unwrap(), "/api/x");
    }

    #[test]
    fn test_strip_keeps_trailing_slash() {
        assert_eq!(strip_segments("/api/users/", 1).unwrap(), "/users/");
    }

    #[test]
    fn test_strip_out_of_range() {
        assert_eq!(
            strip_segments("/api/auth", 3),
            Err(GatewayError::StripPrefixOutOfRange {
                requested: 3,
                available: 2
            })
        );
    }

    #[test]
    fn test_strip_prefix_filter_rewrites_context() {
        let mut c = ctx("/api/auth/login");
        assert!(matches!(
            strip_prefix_on_request(2, &mut c),
            FilterResult::Continue
        ));
        assert_eq!(c.path, "/login");
        assert_eq!(c.inbound_path, "/api/auth/login");

        let mut c = ctx("/api");
        assert!(matches!(
            strip_prefix_on_request(2, &mut c),
            FilterResult::Reject(GatewayError::StripPrefixOutOfRange { .. })
        ));
    }

    #[test]
    fn test_static_request_header() {
        let rule = HeaderRule::new("X-Gateway", Some("API-Gateway"), None).unwrap();
        let mut c = ctx("/");
        rule.append_to_request(&mut c);
        assert_eq!(c.headers.get("x-gateway").unwrap(), "API-Gateway");
    }

    #[test]
    fn test_computed_response_header() {
        let rule = HeaderRule::new("X-Trace", None, Some(ComputedValue::RequestId)).unwrap();
        let mut c = ctx("/");
        c.correlation_id = "abc-123".to_string();
        let mut resp = ResponseContext::new(StatusCode::OK);
        rule.append_to_response(&c, &mut resp);
        assert_eq!(resp.headers.get("x-trace").unwrap(), "abc-123");
    }

    #[test]
    fn test_rule_needs_one_source() {
        assert!(HeaderRule::new("X-A", None, None).is_err());
        assert!(HeaderRule::new("X-A", Some("v"), Some(ComputedValue::EpochMillis)).is_err());
    }
}
