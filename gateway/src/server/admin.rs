use super::GatewayState;
use crate::proxy::context::{full_body, BoxBody};
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, StatusCode};
use hyper::body::Incoming;
use hyper::{Request, Response};
use std::time::SystemTime;

const SERVICE_NAME: &str = "api-gateway";

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response<BoxBody> {
    let body = serde_json::to_string_pretty(value).unwrap_or_default();
    let mut resp = Response::new(full_body(body));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    resp
}

pub async fn handle_admin(
    req: Request<Incoming>,
    state: GatewayState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => {
            let services = state.resolver().list_services();
            let names: Vec<&str> = services.iter().map(|s| s.name.as_str()).collect();
            let host = hostname::get()
                .map(|h| h.to_string_lossy().into_owned())
                .unwrap_or_else(|_| "unknown".to_string());
            Ok(json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "status": "UP",
                    "service": SERVICE_NAME,
                    "version": env!("CARGO_PKG_VERSION"),
                    "host": host,
                    "timestamp": humantime::format_rfc3339_millis(SystemTime::now()).to_string(),
                    "discoveredServices": names,
                    "serviceCount": services.len(),
                }),
            ))
        }

        (&Method::GET, "/health/services") => {
            let services = state.resolver().list_services();
            let instances: serde_json::Map<String, serde_json::Value> = services
                .iter()
                .map(|s| (s.name.clone(), serde_json::json!(s.instances)))
                .collect();
            Ok(json_response(
                StatusCode::OK,
                &serde_json::json!({
                    "services": instances,
                    "timestamp": humantime::format_rfc3339_millis(SystemTime::now()).to_string(),
                }),
            ))
        }

        (&Method::GET, "/routes") => {
            let pipeline = state.pipeline.load();
            let routes: Vec<serde_json::Value> = pipeline
                .routes
                .all_routes()
                .iter()
                .map(|r| {
                    serde_json::json!({
                        "id": r.id,
                        "service": r.service,
                        "predicates": r.predicates.iter().map(|p| format!("{:?}", p)).collect::<Vec<_>>(),
                        "filters": r.filters.iter().map(|f| f.name()).collect::<Vec<_>>(),
                        "timeout_ms": r.timeout.as_millis() as u64,
                        "fallback": r.fallback.as_ref().map(|f| f.service.clone()),
                    })
                })
                .collect();
            let global: Vec<&str> = pipeline
                .chain
                .global_filters()
                .iter()
                .map(|f| f.name())
                .collect();
            Ok(json_response(
                StatusCode::OK,
                &serde_json::json!({"global_filters": global, "routes": routes}),
            ))
        }

        (&Method::GET, "/metrics") => {
            let mut resp = Response::new(full_body(state.metrics.render()));
            resp.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4; charset=utf-8"),
            );
            Ok(resp)
        }

        (&Method::POST, "/reload") => match state.reload().await {
            Ok(routes) => Ok(json_response(
                StatusCode::OK,
                &serde_json::json!({"status": "reloaded", "routes": routes}),
            )),
            Err(e) => Ok(json_response(
                StatusCode::UNPROCESSABLE_ENTITY,
                &serde_json::json!({"status": "rejected", "error": format!("{:#}", e)}),
            )),
        },

        _ => Ok(json_response(
            StatusCode::NOT_FOUND,
            &serde_json::json!({"error": "not found"}),
        )),
    }
}
