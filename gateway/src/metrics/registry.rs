use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the Prometheus recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) record into the global recorder. The handle is only kept for
/// rendering the admin `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric descriptions.
    /// Call once at startup.
    pub fn install() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )?
            .install_recorder()?;

        describe_all();
        Ok(Self { handle })
    }

    /// A recorder that is not installed globally. Macros keep recording into
    /// whatever recorder is active, so `render` on this handle stays empty.
    /// Used when several gateways share one process, e.g. in tests.
    pub fn detached() -> Self {
        let recorder = PrometheusBuilder::new().build_recorder();
        Self {
            handle: recorder.handle(),
        }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn describe_all() {
    // request path
    describe_counter!(
        "gateway_http_requests_total",
        Unit::Count,
        "Total HTTP requests processed"
    );
    describe_histogram!(
        "gateway_http_request_duration_seconds",
        Unit::Seconds,
        "Total request duration from client perspective"
    );
    describe_histogram!(
        "gateway_upstream_request_duration_seconds",
        Unit::Seconds,
        "Duration of a single dispatch attempt"
    );

    // policy filters
    describe_counter!(
        "gateway_rate_limit_rejected_total",
        Unit::Count,
        "Total requests rejected by rate limiter"
    );
    describe_counter!(
        "gateway_rate_limit_allowed_total",
        Unit::Count,
        "Total requests allowed by rate limiter"
    );
    describe_counter!(
        "gateway_auth_rejected_total",
        Unit::Count,
        "Total requests rejected by the authentication gate"
    );

    // dispatch
    describe_counter!(
        "gateway_upstream_retries_total",
        Unit::Count,
        "Total upstream retry attempts"
    );
    describe_counter!(
        "gateway_fallback_total",
        Unit::Count,
        "Total requests answered with a canned fallback payload"
    );

    // connections
    describe_gauge!(
        "gateway_connections_active",
        Unit::Count,
        "Number of active downstream connections"
    );
    describe_counter!(
        "gateway_connections_total",
        Unit::Count,
        "Total connections accepted"
    );

    // config
    describe_gauge!(
        "gateway_config_routes_total",
        Unit::Count,
        "Number of routes currently loaded"
    );
    describe_counter!(
        "gateway_config_reloads_total",
        Unit::Count,
        "Config reload events"
    );
}
