//! Prometheus instrumentation and the aggregate stats counters backing
//! the admin stats endpoint.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;

use nimbus_shared::types::HealthState;

pub struct Metrics {
    pub registry: Registry,
    pub requests_total: IntCounterVec,
    pub request_duration_ms: HistogramVec,
    pub bytes_in_total: IntCounterVec,
    pub bytes_out_total: IntCounterVec,
    pub retries_total: IntCounterVec,
    pub rate_limit_fail_open_total: IntCounter,
    pub health_status: IntGaugeVec,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("gateway_requests_total", "Requests handled by outcome"),
            &["tenant", "service", "method", "status_class", "outcome"],
        )
        .unwrap_or_else(|e| panic!("metrics init: {}", e));
        let request_duration_ms = HistogramVec::new(
            HistogramOpts::new("gateway_request_duration_ms", "Request duration")
                .buckets(vec![5.0, 25.0, 100.0, 250.0, 500.0, 1_000.0, 5_000.0, 30_000.0]),
            &["service"],
        )
        .unwrap_or_else(|e| panic!("metrics init: {}", e));
        let bytes_in_total = IntCounterVec::new(
            Opts::new("gateway_bytes_in_total", "Request body bytes forwarded"),
            &["tenant", "service"],
        )
        .unwrap_or_else(|e| panic!("metrics init: {}", e));
        let bytes_out_total = IntCounterVec::new(
            Opts::new("gateway_bytes_out_total", "Response body bytes streamed"),
            &["tenant", "service"],
        )
        .unwrap_or_else(|e| panic!("metrics init: {}", e));
        let retries_total = IntCounterVec::new(
            Opts::new("gateway_upstream_retries_total", "Upstream retry attempts"),
            &["service"],
        )
        .unwrap_or_else(|e| panic!("metrics init: {}", e));
        let rate_limit_fail_open_total = IntCounter::new(
            "gateway_rate_limit_fail_open_total",
            "Requests admitted without rate-limit enforcement",
        )
        .unwrap_or_else(|e| panic!("metrics init: {}", e));
        let health_status = IntGaugeVec::new(
            Opts::new(
                "gateway_upstream_health",
                "Upstream health (0 unknown, 1 healthy, 2 degraded, 3 unhealthy)",
            ),
            &["service"],
        )
        .unwrap_or_else(|e| panic!("metrics init: {}", e));

        for collector in [
            Box::new(requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(request_duration_ms.clone()),
            Box::new(bytes_in_total.clone()),
            Box::new(bytes_out_total.clone()),
            Box::new(retries_total.clone()),
            Box::new(rate_limit_fail_open_total.clone()),
            Box::new(health_status.clone()),
        ] {
            registry
                .register(collector)
                .unwrap_or_else(|e| panic!("metrics init: {}", e));
        }

        Self {
            registry,
            requests_total,
            request_duration_ms,
            bytes_in_total,
            bytes_out_total,
            retries_total,
            rate_limit_fail_open_total,
            health_status,
        }
    }

    pub fn record_request(
        &self,
        tenant: &str,
        service: &str,
        method: &str,
        status: u16,
        outcome: &str,
        duration_ms: u64,
    ) {
        let status_class = match status {
            100..=199 => "1xx",
            200..=299 => "2xx",
            300..=399 => "3xx",
            400..=499 => "4xx",
            _ => "5xx",
        };
        self.requests_total
            .with_label_values(&[tenant, service, method, status_class, outcome])
            .inc();
        self.request_duration_ms
            .with_label_values(&[service])
            .observe(duration_ms as f64);
    }

    pub fn set_health(&self, service: &str, state: HealthState) {
        let value = match state {
            HealthState::Unknown => 0,
            HealthState::Healthy => 1,
            HealthState::Degraded => 2,
            HealthState::Unhealthy => 3,
        };
        self.health_status.with_label_values(&[service]).set(value);
    }

    /// Prometheus text exposition.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder
            .encode(&self.registry.gather(), &mut buffer)
            .is_err()
        {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    total: u64,
    ok: u64,
    duration_ms_sum: u64,
    per_service: HashMap<String, u64>,
    per_tenant: HashMap<String, u64>,
}

#[derive(Debug, Serialize)]
pub struct StatsOverview {
    pub requests_total: u64,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub per_service: HashMap<String, u64>,
    pub per_tenant: HashMap<String, u64>,
    pub window_seconds: u64,
    pub rate_limit_fail_open_events: u64,
}

/// Aggregate counters since boot, backing `stats.overview`.
pub struct StatsCollector {
    inner: Mutex<StatsInner>,
    started_at: Instant,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StatsInner::default()),
            started_at: Instant::now(),
        }
    }

    pub fn record(&self, tenant: &str, service: &str, status: u16, duration_ms: u64) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.total += 1;
        if (200..400).contains(&status) {
            inner.ok += 1;
        }
        inner.duration_ms_sum += duration_ms;
        *inner.per_service.entry(service.to_string()).or_insert(0) += 1;
        *inner.per_tenant.entry(tenant.to_string()).or_insert(0) += 1;
    }

    pub fn overview(&self, fail_open_events: u64) -> StatsOverview {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let total = inner.total;
        StatsOverview {
            requests_total: total,
            success_rate: if total == 0 {
                1.0
            } else {
                inner.ok as f64 / total as f64
            },
            avg_latency_ms: if total == 0 {
                0.0
            } else {
                inner.duration_ms_sum as f64 / total as f64
            },
            per_service: inner.per_service.clone(),
            per_tenant: inner.per_tenant.clone(),
            window_seconds: self.started_at.elapsed().as_secs(),
            rate_limit_fail_open_events: fail_open_events,
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_encode() {
        let metrics = Metrics::new();
        metrics.record_request("acme", "analytics", "GET", 200, "ok", 12);
        metrics.record_request("acme", "analytics", "GET", 504, "timeout", 1_000);
        metrics.retries_total.with_label_values(&["analytics"]).inc();
        metrics.set_health("analytics", HealthState::Degraded);

        let text = metrics.encode();
        assert!(text.contains("gateway_requests_total"));
        assert!(text.contains("gateway_upstream_health"));
        assert!(text.contains("gateway_upstream_retries_total"));
    }

    #[test]
    fn test_stats_overview_math() {
        let stats = StatsCollector::new();
        stats.record("acme", "analytics", 200, 10);
        stats.record("acme", "billing", 200, 30);
        stats.record("beta", "analytics", 502, 20);

        let overview = stats.overview(4);
        assert_eq!(overview.requests_total, 3);
        assert!((overview.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((overview.avg_latency_ms - 20.0).abs() < 1e-9);
        assert_eq!(overview.per_service["analytics"], 2);
        assert_eq!(overview.per_tenant["acme"], 2);
        assert_eq!(overview.rate_limit_fail_open_events, 4);
    }

    #[test]
    fn test_empty_stats_do_not_divide_by_zero() {
        let stats = StatsCollector::new();
        let overview = stats.overview(0);
        assert_eq!(overview.requests_total, 0);
        assert_eq!(overview.success_rate, 1.0);
        assert_eq!(overview.avg_latency_ms, 0.0);
    }
}
