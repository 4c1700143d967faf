use std::fmt;

/// Every failure the request pipeline can surface to a client.
///
/// Filters short-circuit with one of these; `proxy::fallback::normalize` is
/// the single place that turns them into an HTTP status and a body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    RouteNotFound,
    AuthMissing,
    AuthInvalid(String),
    RateLimited,
    StripPrefixOutOfRange { requested: usize, available: usize },
    PayloadTooLarge,
    DispatchConnectFailed(String),
    DispatchTimeout,
    DispatchBackendError(u16),
    Unexpected(String),
    Config(String),
}

impl GatewayError {
    /// `true` when the backend could not be reached at all, which is the only
    /// case a route-level fallback payload is allowed to answer.
    pub fn is_backend_unreachable(&self) -> bool {
        matches!(
            self,
            GatewayError::DispatchConnectFailed(_) | GatewayError::DispatchTimeout
        )
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::RouteNotFound => write!(f, "no route matched"),
            GatewayError::AuthMissing => write!(f, "missing authorization header"),
            GatewayError::AuthInvalid(msg) => write!(f, "invalid credentials: {}", msg),
            GatewayError::RateLimited => write!(f, "rate limited"),
            GatewayError::StripPrefixOutOfRange {
                requested,
                available,
            } => write!(
                f,
                "strip prefix out of range: requested {} segments, path has {}",
                requested, available
            ),
            GatewayError::PayloadTooLarge => write!(f, "payload too large"),
            GatewayError::DispatchConnectFailed(msg) => {
                write!(f, "upstream connect error: {}", msg)
            }
            GatewayError::DispatchTimeout => write!(f, "upstream timeout"),
            GatewayError::DispatchBackendError(status) => {
                write!(f, "upstream returned status {}", status)
            }
            GatewayError::Unexpected(msg) => write!(f, "internal error: {}", msg),
            GatewayError::Config(msg) => write!(f, "config error: {}", msg),
        }
    }
}

impl std::error::Error for GatewayError {}
