use crate::config::StaticToken;
use crate::error::GatewayError;
use crate::proxy::context::RequestContext;
use http::header::AUTHORIZATION;
use http::{HeaderName, HeaderValue};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

static X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
static X_USER_ROLE: HeaderName = HeaderName::from_static("x-user-role");

/// Who a verified bearer token belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub role: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationError(pub String);

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "token verification failed: {}", self.0)
    }
}

impl std::error::Error for VerificationError {}

/// Validates bearer tokens. Implementations must not block for long: the
/// gate calls `verify` inline on the request path.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity, VerificationError>;
}

/// Looks tokens up in the `[[auth.tokens]]` table.
pub struct StaticTokenVerifier {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: &[StaticToken]) -> Self {
        Self {
            tokens: tokens
                .iter()
                .map(|t| {
                    (
                        t.token.clone(),
                        Identity {
                            user_id: t.user_id.clone(),
                            role: t.role.clone(),
                        },
                    )
                })
                .collect(),
        }
    }
}

impl TokenVerifier for StaticTokenVerifier {
    fn verify(&self, token: &str) -> Result<Identity, VerificationError> {
        self.tokens
            .get(token)
            .cloned()
            .ok_or_else(|| VerificationError("unknown token".to_string()))
    }
}

/// Bearer-token gate shared by every route that lists `authenticate`.
pub struct AuthGate {
    /// Allow-list prefixes with any trailing `/**` already removed.
    public_prefixes: Vec<String>,
    verifier: Arc<dyn TokenVerifier>,
}

impl AuthGate {
    pub fn new(public_paths: &[String], verifier: Arc<dyn TokenVerifier>) -> Self {
        let public_prefixes = public_paths
            .iter()
            .map(|p| p.strip_suffix("/**").unwrap_or(p.as_str()).to_string())
            .collect();
        Self {
            public_prefixes,
            verifier,
        }
    }

    pub fn is_public(&self, path: &str) -> bool {
        self.public_prefixes.iter().any(|p| path.starts_with(p.as_str()))
    }

    /// On success the verified identity overwrites any client-supplied
    /// `X-User-Id` / `X-User-Role` on the forwarded request.
    pub fn check(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        if self.is_public(&ctx.inbound_path) {
            return Ok(());
        }

        let result = self.authenticate(ctx);
        if let Err(ref e) = result {
            tracing::debug!(
                "filter: authenticate: rejected, path={}, request_id={}, error={}",
                ctx.inbound_path,
                ctx.correlation_id,
                e
            );
            metrics::counter!(
                "gateway_auth_rejected_total",
                "route" => ctx.route_id.clone().unwrap_or_default(),
            )
            .increment(1);
        }
        result
    }

    fn authenticate(&self, ctx: &mut RequestContext) -> Result<(), GatewayError> {
        let header = ctx
            .headers
            .get(AUTHORIZATION)
            .ok_or(GatewayError::AuthMissing)?;

        let token = header
            .to_str()
            .ok()
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                GatewayError::AuthInvalid("Invalid Authorization header format".to_string())
            })?;

        let identity = self.verifier.verify(token).map_err(|e| {
            tracing::debug!("filter: authenticate: {}", e);
            GatewayError::AuthInvalid("Invalid or expired token".to_string())
        })?;

        let user_id = HeaderValue::from_str(&identity.user_id)
            .map_err(|_| GatewayError::AuthInvalid("Invalid or expired token".to_string()))?;
        let role = HeaderValue::from_str(&identity.role)
            .map_err(|_| GatewayError::AuthInvalid("Invalid or expired token".to_string()))?;
        ctx.headers.insert(X_USER_ID.clone(), user_id);
        ctx.headers.insert(X_USER_ROLE.clone(), role);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method};

    fn gate() -> AuthGate {
        let tokens = vec![StaticToken {
            token: "valid-token-123".into(),
            user_id: "user123".into(),
            role: "ADMIN".into(),
        }];
        AuthGate::new(
            &["/api/auth/login".to_string(), "/api/health/**".to_string()],
            Arc::new(StaticTokenVerifier::new(&tokens)),
        )
    }

    fn ctx(path: &str, auth: Option<&'static str>) -> RequestContext {
        let mut headers = HeaderMap::new();
        if let Some(v) = auth {
            headers.insert(AUTHORIZATION, HeaderValue::from_static(v));
        }
        RequestContext::new(
            Method::GET,
            path.to_string(),
            None,
            headers,
            "127.0.0.1:9000".parse().unwrap(),
        )
    }

    #[test]
    fn test_public_paths_skip_auth() {
        let g = gate();
        assert!(g.check(&mut ctx("/api/auth/login", None)).is_ok());
        assert!(g.check(&mut ctx("/api/health", None)).is_ok());
        assert!(g.check(&mut ctx("/api/health/services", None)).is_ok());
    }

    #[test]
    fn test_missing_header() {
        assert_eq!(
            gate().check(&mut ctx("/api/admin/users", None)),
            Err(GatewayError::AuthMissing)
        );
    }

    #[test]
    fn test_not_bearer() {
        let res = gate().check(&mut ctx("/api/admin/users", Some("Basic dXNlcjpwYXNz")));
        assert!(matches!(res, Err(GatewayError::AuthInvalid(ref m)) if m.contains("format")));
    }

    #[test]
    fn test_empty_bearer() {
        let res = gate().check(&mut ctx("/api/admin/users", Some("Bearer   ")));
        assert!(matches!(res, Err(GatewayError::AuthInvalid(_))));
    }

    #[test]
    fn test_unknown_token() {
        let res = gate().check(&mut ctx("/api/admin/users", Some("Bearer nope")));
        assert!(matches!(res, Err(GatewayError::AuthInvalid(ref m)) if m.contains("expired")));
    }

    #[test]
    fn test_valid_token_overwrites_identity_headers() {
        let mut c = ctx("/api/admin/users", Some("Bearer valid-token-123"));
        c.headers
            .insert("x-user-id", HeaderValue::from_static("spoofed"));
        gate().check(&mut c).unwrap();
        assert_eq!(c.headers.get_all("x-user-id").iter().count(), 1);
        assert_eq!(c.headers.get("x-user-id").unwrap(), "user123");
        assert_eq!(c.headers.get("x-user-role").unwrap(), "ADMIN");
    }
}
