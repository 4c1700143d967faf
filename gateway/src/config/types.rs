use serde::{Deserialize, Deserializer, Serialize};

/// Deserialize a `T` that implements `Default`; treats JSON `null` the same as
/// a missing field (returns `T::default()`).  Use with:
///   `#[serde(default, deserialize_with = "deserialize_null_default")]`
fn deserialize_null_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub auth: AuthConfig,

    /// Defaults for every `rate_limit` route filter.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub cors: CorsConfig,

    /// Filters applied to every request, in this exact order. `request_id`
    /// must come first.
    #[serde(default = "default_global_filters")]
    pub global_filters: Vec<GlobalFilterKind>,

    /// Dispatch timeout for routes that do not declare their own.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub services: Vec<ServiceConfig>,

    /// Canned payloads, merged over the built-in catalogue by id.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub fallbacks: Vec<FallbackConfig>,

    /// Evaluated in declaration order, first match wins.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_admin_listen")]
    pub admin_listen: String,

    /// Tokio worker threads. `None` uses the host CPU count.
    #[serde(default)]
    pub worker_threads: Option<usize>,

    /// Inbound bodies larger than this are rejected with 413.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: u64,

    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            admin_listen: default_admin_listen(),
            worker_threads: None,
            max_body_bytes: default_max_body_bytes(),
            drain_timeout_secs: default_drain_timeout(),
        }
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_admin_listen() -> String {
    "0.0.0.0:9091".to_string()
}

fn default_max_body_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_drain_timeout() -> u64 {
    30
}

pub(crate) fn default_timeout_ms() -> u64 {
    5000
}

pub(crate) fn default_global_filters() -> Vec<GlobalFilterKind> {
    vec![
        GlobalFilterKind::RequestId,
        GlobalFilterKind::AccessLog,
        GlobalFilterKind::Cors,
        GlobalFilterKind::ResponseTiming,
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalFilterKind {
    RequestId,
    AccessLog,
    Cors,
    ResponseTiming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Prefix allow-list. A trailing `/**` is ignored when comparing.
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,

    /// Token table for the built-in static verifier.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub tokens: Vec<StaticToken>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            public_paths: default_public_paths(),
            tokens: Vec::new(),
        }
    }
}

fn default_public_paths() -> Vec<String> {
    vec![
        "/api/health/**".to_string(),
        "/api/auth/login".to_string(),
        "/api/auth/register".to_string(),
        "/actuator/**".to_string(),
        "/fallback/**".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticToken {
    pub token: String,
    pub user_id: String,
    #[serde(default = "default_role")]
    pub role: String,
}

fn default_role() -> String {
    "USER".to_string()
}

/// Token bucket parameters. `capacity` is the burst size, `refill_per_sec`
/// the sustained rate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_capacity")]
    pub capacity: f64,

    #[serde(default = "default_refill")]
    pub refill_per_sec: f64,

    /// Buckets untouched for this long are swept.
    #[serde(default = "default_idle_ttl")]
    pub idle_ttl_secs: u64,

    /// Tried in order; the first strategy that yields a key wins.
    #[serde(default = "default_key_strategies")]
    pub key_strategies: Vec<KeyStrategy>,

    #[serde(default = "default_user_id_header")]
    pub user_id_header: String,

    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_per_sec: default_refill(),
            idle_ttl_secs: default_idle_ttl(),
            key_strategies: default_key_strategies(),
            user_id_header: default_user_id_header(),
            api_key_header: default_api_key_header(),
        }
    }
}

fn default_capacity() -> f64 {
    20.0
}

fn default_refill() -> f64 {
    10.0
}

fn default_idle_ttl() -> u64 {
    300
}

fn default_key_strategies() -> Vec<KeyStrategy> {
    vec![
        KeyStrategy::UserId,
        KeyStrategy::ApiKey,
        KeyStrategy::RemoteAddr,
        KeyStrategy::Path,
    ]
}

fn default_user_id_header() -> String {
    "X-User-Id".to_string()
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    UserId,
    ApiKey,
    RemoteAddr,
    Path,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Glob patterns, e.g. `*` or `https://*.example.com`.
    #[serde(default = "default_origin_patterns")]
    pub allowed_origin_patterns: Vec<String>,

    #[serde(default = "default_cors_methods")]
    pub allowed_methods: Vec<String>,

    #[serde(default = "default_cors_headers")]
    pub allowed_headers: Vec<String>,

    #[serde(default = "default_exposed_headers")]
    pub exposed_headers: Vec<String>,

    #[serde(default = "default_true")]
    pub allow_credentials: bool,

    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origin_patterns: default_origin_patterns(),
            allowed_methods: default_cors_methods(),
            allowed_headers: default_cors_headers(),
            exposed_headers: default_exposed_headers(),
            allow_credentials: true,
            max_age_secs: default_max_age(),
        }
    }
}

fn default_origin_patterns() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_cors_methods() -> Vec<String> {
    ["GET", "POST", "PUT", "DELETE", "OPTIONS", "PATCH"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_cors_headers() -> Vec<String> {
    [
        "Authorization",
        "Content-Type",
        "X-Requested-With",
        "Accept",
        "Origin",
        "Access-Control-Request-Method",
        "Access-Control-Request-Headers",
        "X-Request-ID",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_exposed_headers() -> Vec<String> {
    ["X-Request-ID", "X-Response-Time", "X-Total-Count"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_max_age() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

/// A logical backend and its statically known instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,

    #[serde(default = "default_scheme")]
    pub scheme: String,

    /// "roundrobin" or "random".
    #[serde(default = "default_lb")]
    pub lb: String,

    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub nodes: Vec<NodeConfig>,
}

fn default_scheme() -> String {
    "http".to_string()
}

fn default_lb() -> String {
    "roundrobin".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    100
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub id: String,
    pub service: String,
    pub message: String,
    pub suggestion: String,
}

impl FallbackConfig {
    fn new(id: &str, service: &str, message: &str, suggestion: &str) -> Self {
        Self {
            id: id.to_string(),
            service: service.to_string(),
            message: message.to_string(),
            suggestion: suggestion.to_string(),
        }
    }
}

/// The canned payloads every gateway ships with. `[[fallbacks]]` entries with
/// the same id replace these.
pub fn builtin_fallbacks() -> Vec<FallbackConfig> {
    vec![
        FallbackConfig::new(
            "user",
            "user-service",
            "User service is currently unavailable. Please try again later.",
            "Check user service health or contact support",
        ),
        FallbackConfig::new(
            "product",
            "product-service",
            "Product service is currently unavailable. Please try again later.",
            "Browse cached products or try again in a few minutes",
        ),
        FallbackConfig::new(
            "order",
            "order-service",
            "Order service is currently unavailable. Please try again later.",
            "Your order may be saved. Please check order history later",
        ),
        FallbackConfig::new(
            "auth",
            "auth-service",
            "Authentication service is currently unavailable. Please try again later.",
            "Try logging in again or contact support if issue persists",
        ),
        FallbackConfig::new(
            "default",
            "unknown",
            "Service is currently unavailable. Please try again later.",
            "Please try again in a few minutes or contact support",
        ),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub id: String,

    /// ANDed together.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub predicates: Vec<PredicateConfig>,

    /// Applied in order after the global filters.
    #[serde(default, deserialize_with = "deserialize_null_default")]
    pub filters: Vec<FilterConfig>,

    /// Logical service name. An `lb://` prefix is accepted and stripped.
    pub target_service: String,

    /// Fallback catalogue id answered when the backend is unreachable.
    #[serde(default)]
    pub fallback: Option<String>,

    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Absent means exactly one attempt.
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl RouteConfig {
    pub fn service_name(&self) -> &str {
        self.target_service
            .strip_prefix("lb://")
            .unwrap_or(self.target_service.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PredicateConfig {
    /// Literal path, optionally ending in `/**`.
    Path { pattern: String },
    Method { methods: Vec<String> },
    /// Regex matched against the first value of the header.
    Header { name: String, regex: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FilterConfig {
    StripPrefix {
        parts: usize,
    },
    AddRequestHeader {
        name: String,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        computed: Option<ComputedValue>,
    },
    AddResponseHeader {
        name: String,
        #[serde(default)]
        value: Option<String>,
        #[serde(default)]
        computed: Option<ComputedValue>,
    },
    Authenticate,
    /// Unset fields inherit from the top-level `[rate_limit]` section.
    RateLimit {
        #[serde(default)]
        capacity: Option<f64>,
        #[serde(default)]
        refill_per_sec: Option<f64>,
        #[serde(default)]
        key_strategies: Option<Vec<KeyStrategy>>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputedValue {
    RequestId,
    ElapsedMillis,
    EpochMillis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    #[serde(default = "default_retry_attempts")]
    pub attempts: u32,

    #[serde(default = "default_true")]
    pub on_connect_failure: bool,

    #[serde(default = "default_true")]
    pub on_timeout: bool,

    #[serde(default = "default_retry_statuses")]
    pub on_statuses: Vec<u16>,
}

fn default_retry_attempts() -> u32 {
    2
}

fn default_retry_statuses() -> Vec<u16> {
    vec![502, 503, 504]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_full_serde() {
        let json = r#"{
            "id": "admin-service",
            "predicates": [
                {"type": "path", "pattern": "/api/admin/**"},
                {"type": "method", "methods": ["GET", "POST", "PUT", "DELETE"]},
                {"type": "header", "name": "Content-Length", "regex": "\\d+"}
            ],
            "filters": [
                {"type": "authenticate"},
                {"type": "rate_limit", "capacity": 5.0},
                {"type": "strip_prefix", "parts": 2},
                {"type": "add_request_header", "name": "X-Admin-Request", "value": "true"},
                {"type": "add_response_header", "name": "X-Served-At", "computed": "epoch_millis"}
            ],
            "target_service": "lb://admin-service",
            "fallback": "default",
            "timeout_ms": 2500,
            "retry": {"attempts": 3, "on_statuses": [503]}
        }"#;

        let route: RouteConfig = serde_json::from_str(json).unwrap();
        assert_eq!(route.id, "admin-service");
        assert_eq!(route.service_name(), "admin-service");
        assert_eq!(route.predicates.len(), 3);
        assert!(matches!(
            &route.predicates[0],
            PredicateConfig::Path { pattern } if pattern == "/api/admin/**"
        ));
        assert!(matches!(
            &route.predicates[1],
            PredicateConfig::Method { methods } if methods.len() == 4
        ));
        assert!(matches!(
            &route.predicates[2],
            PredicateConfig::Header { name, regex } if name == "Content-Length" && regex == "\\d+"
        ));

        assert_eq!(route.filters.len(), 5);
        assert!(matches!(route.filters[0], FilterConfig::Authenticate));
        assert!(matches!(
            route.filters[1],
            FilterConfig::RateLimit {
                capacity: Some(c),
                refill_per_sec: None,
                key_strategies: None
            } if c == 5.0
        ));
        assert!(matches!(route.filters[2], FilterConfig::StripPrefix { parts: 2 }));
        assert!(matches!(
            &route.filters[4],
            FilterConfig::AddResponseHeader {
                computed: Some(ComputedValue::EpochMillis),
                value: None,
                ..
            }
        ));

        assert_eq!(route.fallback.as_deref(), Some("default"));
        assert_eq!(route.timeout_ms, Some(2500));
        let retry = route.retry.unwrap();
        assert_eq!(retry.attempts, 3);
        assert!(retry.on_connect_failure);
        assert!(retry.on_timeout);
        assert_eq!(retry.on_statuses, vec![503]);
    }

    #[test]
    fn test_route_null_lists() {
        let json = r#"{
            "id": "bare",
            "predicates": null,
            "filters": null,
            "target_service": "svc"
        }"#;
        let route: RouteConfig = serde_json::from_str(json).unwrap();
        assert!(route.predicates.is_empty());
        assert!(route.filters.is_empty());
        assert!(route.retry.is_none());
        assert_eq!(route.service_name(), "svc");
    }

    #[test]
    fn test_rate_limit_defaults() {
        let rl = RateLimitConfig::default();
        assert_eq!(rl.capacity, 20.0);
        assert_eq!(rl.refill_per_sec, 10.0);
        assert_eq!(
            rl.key_strategies,
            vec![
                KeyStrategy::UserId,
                KeyStrategy::ApiKey,
                KeyStrategy::RemoteAddr,
                KeyStrategy::Path
            ]
        );
    }

    #[test]
    fn test_builtin_fallbacks_have_default() {
        let builtins = builtin_fallbacks();
        assert_eq!(builtins.len(), 5);
        assert!(builtins.iter().any(|f| f.id == "default" && f.service == "unknown"));
        assert!(builtins.iter().any(|f| f.id == "auth" && f.service == "auth-service"));
    }

    #[test]
    fn test_global_filter_kind_names() {
        let kinds: Vec<GlobalFilterKind> =
            serde_json::from_str(r#"["request_id", "cors", "response_timing"]"#).unwrap();
        assert_eq!(
            kinds,
            vec![
                GlobalFilterKind::RequestId,
                GlobalFilterKind::Cors,
                GlobalFilterKind::ResponseTiming
            ]
        );
    }
}
