use super::types::*;
use super::GatewayConfig;

fn route(id: &str, service: &str) -> RouteConfig {
    RouteConfig {
        id: id.into(),
        predicates: vec![PredicateConfig::Path {
            pattern: format!("/api/{id}/**"),
        }],
        filters: vec![],
        target_service: format!("lb://{service}"),
        fallback: None,
        timeout_ms: None,
        retry: None,
    }
}

fn service(name: &str) -> ServiceConfig {
    ServiceConfig {
        name: name.into(),
        scheme: "http".into(),
        lb: "roundrobin".into(),
        nodes: vec![NodeConfig {
            host: "127.0.0.1".into(),
            port: 8081,
            weight: 100,
        }],
    }
}

fn base_config() -> GatewayConfig {
    GatewayConfig {
        services: vec![service("user-service")],
        routes: vec![route("users", "user-service")],
        ..GatewayConfig::default()
    }
}

#[test]
fn test_load_toml_config() {
    let toml = r#"
default_timeout_ms = 3000

[server]
listen = "127.0.0.1:18080"

[[services]]
name = "auth-service"
nodes = [{ host = "127.0.0.1", port = 8081 }]

[[routes]]
id = "auth-service"
target_service = "lb://auth-service"
fallback = "auth"
predicates = [{ type = "path", pattern = "/api/auth/**" }]
filters = [
    { type = "strip_prefix", parts = 2 },
    { type = "add_request_header", name = "X-Gateway", value = "API-Gateway" },
]
"#;
    let tmp = std::env::temp_dir().join("waypoint_test_config.toml");
    std::fs::write(&tmp, toml).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    std::fs::remove_file(&tmp).ok();

    assert_eq!(cfg.default_timeout_ms, 3000);
    assert_eq!(cfg.server.listen, "127.0.0.1:18080");
    assert_eq!(cfg.routes.len(), 1);
    assert_eq!(cfg.routes[0].service_name(), "auth-service");
    assert_eq!(cfg.routes[0].filters.len(), 2);
    assert_eq!(cfg.services[0].nodes[0].weight, 100);
    assert_eq!(cfg.global_filters[0], GlobalFilterKind::RequestId);
}

#[test]
fn test_load_json_config() {
    let json = r#"{
        "routes": [{
            "id": "orders",
            "target_service": "order-service",
            "predicates": [{"type": "path", "pattern": "/api/orders/**"}],
            "filters": [{"type": "authenticate"}]
        }]
    }"#;
    let tmp = std::env::temp_dir().join("waypoint_test_config.json");
    std::fs::write(&tmp, json).unwrap();
    let cfg = GatewayConfig::load(&tmp).unwrap();
    std::fs::remove_file(&tmp).ok();

    assert_eq!(cfg.routes.len(), 1);
    assert!(cfg.services.is_empty());
    assert_eq!(cfg.routes.len(), 1);
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let path = std::env::temp_dir().join("waypoint_does_not_exist.toml");
    let cfg = GatewayConfig::load(&path).unwrap();
    assert!(cfg.routes.is_empty());
    assert_eq!(cfg.default_timeout_ms, 5000);
}

#[test]
fn test_load_unknown_extension_fails() {
    let tmp = std::env::temp_dir().join("waypoint_test_config.yaml");
    std::fs::write(&tmp, "routes: []").unwrap();
    let res = GatewayConfig::load(&tmp);
    std::fs::remove_file(&tmp).ok();
    assert!(res.is_err());
}

#[test]
fn test_validate_base_config_ok() {
    assert!(base_config().validate().is_ok());
}

#[test]
fn test_validate_request_id_must_be_first() {
    let mut cfg = base_config();
    cfg.global_filters = vec![GlobalFilterKind::AccessLog, GlobalFilterKind::RequestId];
    assert!(cfg.validate().is_err());

    cfg.global_filters = vec![];
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_duplicate_global_filter_fails() {
    let mut cfg = base_config();
    cfg.global_filters = vec![
        GlobalFilterKind::RequestId,
        GlobalFilterKind::Cors,
        GlobalFilterKind::Cors,
    ];
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_duplicate_route_id_fails() {
    let mut cfg = base_config();
    cfg.routes.push(route("users", "user-service"));
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_unknown_service_fails() {
    let mut cfg = base_config();
    cfg.routes.push(route("orders", "order-service"));
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_unknown_service_ok_without_static_services() {
    let mut cfg = base_config();
    cfg.services.clear();
    cfg.routes.push(route("orders", "order-service"));
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_fallback_ids() {
    let mut cfg = base_config();
    cfg.routes[0].fallback = Some("user".into());
    assert!(cfg.validate().is_ok());

    cfg.routes[0].fallback = Some("inventory".into());
    assert!(cfg.validate().is_err());

    cfg.fallbacks.push(FallbackConfig {
        id: "inventory".into(),
        service: "inventory-service".into(),
        message: "down".into(),
        suggestion: "later".into(),
    });
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_bad_header_regex_fails() {
    let mut cfg = base_config();
    cfg.routes[0].predicates.push(PredicateConfig::Header {
        name: "Content-Length".into(),
        regex: "(\\d+".into(),
    });
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_path_pattern() {
    let mut cfg = base_config();
    cfg.routes[0].predicates = vec![PredicateConfig::Path {
        pattern: "api/users".into(),
    }];
    assert!(cfg.validate().is_err());

    cfg.routes[0].predicates = vec![PredicateConfig::Path {
        pattern: "/api/*/users".into(),
    }];
    assert!(cfg.validate().is_err());

    cfg.routes[0].predicates = vec![PredicateConfig::Path {
        pattern: "/**".into(),
    }];
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_header_filter_needs_one_source() {
    let mut cfg = base_config();
    cfg.routes[0].filters.push(FilterConfig::AddRequestHeader {
        name: "X-Gateway".into(),
        value: Some("API-Gateway".into()),
        computed: Some(ComputedValue::RequestId),
    });
    assert!(cfg.validate().is_err());

    cfg.routes[0].filters = vec![FilterConfig::AddResponseHeader {
        name: "X-Gateway".into(),
        value: None,
        computed: None,
    }];
    assert!(cfg.validate().is_err());

    cfg.routes[0].filters = vec![FilterConfig::AddResponseHeader {
        name: "X-Served-At".into(),
        value: None,
        computed: Some(ComputedValue::EpochMillis),
    }];
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_retry_attempts_zero_fails() {
    let mut cfg = base_config();
    cfg.routes[0].retry = Some(RetryConfig {
        attempts: 0,
        on_connect_failure: true,
        on_timeout: true,
        on_statuses: vec![503],
    });
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_rate_limit_bucket() {
    let mut cfg = base_config();
    cfg.routes[0].filters.push(FilterConfig::RateLimit {
        capacity: Some(0.0),
        refill_per_sec: None,
        key_strategies: None,
    });
    assert!(cfg.validate().is_err());

    cfg.routes[0].filters = vec![FilterConfig::RateLimit {
        capacity: Some(3.0),
        refill_per_sec: Some(2.0),
        key_strategies: Some(vec![]),
    }];
    assert!(cfg.validate().is_err());

    let mut cfg = base_config();
    cfg.rate_limit.refill_per_sec = f64::NAN;
    assert!(cfg.validate().is_err());
}

#[test]
fn test_validate_zero_timeouts_fail() {
    let mut cfg = base_config();
    cfg.default_timeout_ms = 0;
    assert!(cfg.validate().is_err());

    let mut cfg = base_config();
    cfg.routes[0].timeout_ms = Some(0);
    let err = cfg.validate().unwrap_err();
    assert!(err.to_string().contains("timeout_ms"));

    cfg.routes[0].timeout_ms = Some(1);
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_unverified_user_keys() {
    let limit = |key_strategies| FilterConfig::RateLimit {
        capacity: None,
        refill_per_sec: None,
        key_strategies,
    };

    let mut cfg = base_config();
    cfg.routes = vec![
        route("open", "user-service"),
        route("gated", "user-service"),
        route("by-ip", "user-service"),
        route("late-auth", "user-service"),
    ];
    cfg.routes[0].filters = vec![limit(None)];
    cfg.routes[1].filters = vec![FilterConfig::Authenticate, limit(None)];
    cfg.routes[2].filters = vec![limit(Some(vec![KeyStrategy::RemoteAddr]))];
    cfg.routes[3].filters = vec![limit(None), FilterConfig::Authenticate];

    assert_eq!(cfg.unverified_user_keys(), vec!["open", "late-auth"]);
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_validate_bad_service_scheme_fails() {
    let mut cfg = base_config();
    cfg.services[0].scheme = "grpc".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn test_deserialize_defaults_from_empty_toml() {
    let cfg: GatewayConfig = toml::from_str("").unwrap();
    assert_eq!(cfg.server.listen, "0.0.0.0:8080");
    assert_eq!(cfg.server.max_body_bytes, 10 * 1024 * 1024);
    assert_eq!(cfg.global_filters.len(), 4);
    assert!(cfg.auth.public_paths.iter().any(|p| p == "/api/auth/login"));
    assert!(cfg.cors.allow_credentials);
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_sample_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config.toml");
    let cfg = GatewayConfig::load(&path).unwrap();
    assert_eq!(cfg.routes.len(), 7);
    assert_eq!(cfg.routes[0].id, "auth-service");
    assert_eq!(cfg.services.len(), 7);
    assert!(cfg
        .routes
        .iter()
        .any(|r| r.id == "file-service" && r.predicates.len() == 2));
    assert!(cfg.unverified_user_keys().is_empty());
}
