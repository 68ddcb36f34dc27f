use axum::{response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

/// A container for all Prometheus metric collectors, shared via `Arc` and
/// updated from the ingress and HTTP tasks: maps ingested, pose updates
/// published, ICP runs by outcome, calibration cache hits vs misses, and
/// HTTP request count.
pub struct Metrics {
    pub registry: Registry,
    pub maps_ingested_total: IntCounter,
    pub poses_published_total: IntCounter,
    pub icp_runs_total: IntCounterVec,
    pub calibration_cache_hits_total: IntCounter,
    pub calibration_cache_misses_total: IntCounter,
    pub http_requests_total: IntCounter,
    pub known_robots: IntGauge,
}

impl Metrics {
    /// Creates a new `Metrics` struct, initializing and registering all collectors.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("tudomesh".into()), None)
            .expect("Failed to create custom metrics registry");

        macro_rules! reg {
            ($metric:expr) => {{
                let collector = $metric;
                registry
                    .register(Box::new(collector.clone()))
                    .expect("Failed to register metric");
                collector
            }};
        }

        Self {
            maps_ingested_total: reg!(IntCounter::new(
                "maps_ingested_total",
                "Total number of map payloads received from robots"
            )
            .unwrap()),
            poses_published_total: reg!(IntCounter::new(
                "poses_published_total",
                "Total number of LivePose updates emitted"
            )
            .unwrap()),
            icp_runs_total: reg!(IntCounterVec::new(
                Opts::new("icp_runs_total", "Total ICP solver runs, by outcome"),
                &["outcome"],
            )
            .unwrap()),
            calibration_cache_hits_total: reg!(IntCounter::new(
                "calibration_cache_hits_total",
                "Transform lookups served from an existing calibration entry"
            )
            .unwrap()),
            calibration_cache_misses_total: reg!(IntCounter::new(
                "calibration_cache_misses_total",
                "Transform lookups that fell back to Identity for an unknown id"
            )
            .unwrap()),
            http_requests_total: reg!(IntCounter::new(
                "http_requests_total",
                "Total number of HTTP requests handled"
            )
            .unwrap()),
            known_robots: reg!(IntGauge::new(
                "known_robots",
                "Number of robots with at least one decoded map"
            )
            .unwrap()),
            registry,
        }
    }

    /// Creates an `axum::Router` that serves the metrics on the `/metrics` endpoint.
    pub fn router(&self) -> Router {
        let registry = self.registry.clone();
        Router::new().route(
            "/metrics",
            get(move || {
                let registry = registry.clone();
                async move {
                    let metric_families = registry.gather();
                    let mut buffer = Vec::new();
                    let encoder = TextEncoder::new();
                    encoder
                        .encode(&metric_families, &mut buffer)
                        .expect("Failed to encode metrics");
                    String::from_utf8(buffer)
                        .expect("Metrics buffer is not valid UTF-8")
                        .into_response()
                }
            }),
        )
    }

    pub fn record_icp_outcome(&self, outcome: &str) {
        self.icp_runs_total.with_label_values(&[outcome]).inc();
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_metrics_registers_without_panicking() {
        let metrics = Metrics::new();
        metrics.maps_ingested_total.inc();
        metrics.record_icp_outcome("converged");
        let families = metrics.registry.gather();
        assert!(!families.is_empty());
    }
}
