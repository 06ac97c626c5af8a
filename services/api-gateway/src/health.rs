//! Upstream health probing and aggregation.
//!
//! A background loop probes every registered service in parallel on a
//! fixed interval; results land in a snapshot cache plus a bounded ring
//! per service for trend reporting. On-demand probes are deduplicated so
//! at most one is in flight per service, with concurrent callers sharing
//! the result. The loop is supervised and restarts itself if it panics.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use nimbus_shared::types::{HealthRecord, HealthState, ServiceId};
use nimbus_shared::upstream::UpstreamService;

use crate::error::{ApiGatewayError, ApiResult};
use crate::metrics::Metrics;
use crate::registry::ServiceRegistry;

const RING_CAPACITY: usize = 64;
const PROBE_TIMEOUT_CAP: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
struct HealthEntry {
    latest: HealthRecord,
    ring: VecDeque<HealthRecord>,
}

type SharedProbe = Shared<BoxFuture<'static, HealthRecord>>;

pub struct HealthAggregator {
    client: reqwest::Client,
    registry: Arc<ServiceRegistry>,
    metrics: Arc<Metrics>,
    degraded_latency: Duration,
    cache: Arc<RwLock<HashMap<ServiceId, HealthEntry>>>,
    in_flight: Arc<Mutex<HashMap<ServiceId, SharedProbe>>>,
}

impl HealthAggregator {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        metrics: Arc<Metrics>,
        degraded_latency_ms: u64,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            registry,
            metrics,
            degraded_latency: Duration::from_millis(degraded_latency_ms),
            cache: Arc::new(RwLock::new(HashMap::new())),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Latest cached record; `unknown` for services never probed since
    /// boot. `None` when the id is not registered at all.
    pub fn status(&self, service_id: &str) -> Option<HealthRecord> {
        self.registry.get(service_id)?;
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        Some(
            cache
                .get(service_id)
                .map(|e| e.latest.clone())
                .unwrap_or_else(|| HealthRecord::unknown(service_id)),
        )
    }

    /// Recent observations, oldest first.
    pub fn history(&self, service_id: &str) -> Option<Vec<HealthRecord>> {
        self.registry.get(service_id)?;
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        Some(
            cache
                .get(service_id)
                .map(|e| e.ring.iter().cloned().collect())
                .unwrap_or_default(),
        )
    }

    /// Snapshot of every registered service's latest record.
    pub fn snapshot(&self) -> HashMap<ServiceId, HealthRecord> {
        let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
        self.registry
            .list()
            .into_iter()
            .map(|service| {
                let record = cache
                    .get(&service.id)
                    .map(|e| e.latest.clone())
                    .unwrap_or_else(|| HealthRecord::unknown(&service.id));
                (service.id.clone(), record)
            })
            .collect()
    }

    /// Composite status across all registered services.
    pub fn overall(&self) -> HealthState {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            return HealthState::Unknown;
        }
        let mut any_degraded = false;
        let mut any_unknown = false;
        let mut any_healthy = false;
        for record in snapshot.values() {
            match record.status {
                HealthState::Unhealthy => return HealthState::Unhealthy,
                HealthState::Degraded => any_degraded = true,
                HealthState::Unknown => any_unknown = true,
                HealthState::Healthy => any_healthy = true,
            }
        }
        if any_degraded {
            HealthState::Degraded
        } else if any_unknown && any_healthy {
            // Partially probed: not all-healthy, not boot-time unknown.
            HealthState::Degraded
        } else if any_unknown {
            HealthState::Unknown
        } else {
            HealthState::Healthy
        }
    }

    /// One probe cycle over every registered service, fanned out in
    /// parallel so a slow upstream never delays the others.
    pub async fn probe_all(&self) {
        let services = self.registry.list();
        let probes = services.iter().map(|service| {
            probe_service(self.client.clone(), service.clone(), self.degraded_latency)
        });
        let records = futures::future::join_all(probes).await;
        for record in records {
            self.store(record);
        }
    }

    /// Synchronous single-service probe. Concurrent callers for the same
    /// service share one in-flight probe and its result.
    pub async fn check_now(&self, service_id: &str) -> ApiResult<HealthRecord> {
        let service = self
            .registry
            .get(service_id)
            .ok_or_else(|| ApiGatewayError::RouteNotFound {
                path: format!("/_gateway/health/{}", service_id),
            })?;

        let probe = {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(existing) = in_flight.get(service_id) {
                existing.clone()
            } else {
                let client = self.client.clone();
                let degraded_latency = self.degraded_latency;
                let cache = self.cache.clone();
                let metrics = self.metrics.clone();
                let fut: SharedProbe = async move {
                    let record = probe_service(client, service, degraded_latency).await;
                    store_record(&cache, &metrics, record.clone());
                    record
                }
                .boxed()
                .shared();
                in_flight.insert(service_id.to_string(), fut.clone());
                fut
            }
        };

        let record = probe.await;
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(service_id);
        Ok(record)
    }

    fn store(&self, record: HealthRecord) {
        store_record(&self.cache, &self.metrics, record);
    }
}

fn store_record(
    cache: &RwLock<HashMap<ServiceId, HealthEntry>>,
    metrics: &Metrics,
    record: HealthRecord,
) {
    metrics.set_health(&record.service_id, record.status);
    let mut cache = cache.write().unwrap_or_else(|e| e.into_inner());
    let entry = cache
        .entry(record.service_id.clone())
        .or_insert_with(|| HealthEntry {
            latest: record.clone(),
            ring: VecDeque::with_capacity(RING_CAPACITY),
        });
    if entry.ring.len() == RING_CAPACITY {
        entry.ring.pop_front();
    }
    entry.ring.push_back(record.clone());
    entry.latest = record;
}

async fn probe_service(
    client: reqwest::Client,
    service: Arc<UpstreamService>,
    degraded_latency: Duration,
) -> HealthRecord {
    let timeout = service.timeout().min(PROBE_TIMEOUT_CAP);
    let url = service.health_url();
    let started = std::time::Instant::now();

    let (status, latency_ms, error) = match client.get(&url).timeout(timeout).send().await {
        Ok(response) => {
            let latency = started.elapsed();
            let latency_ms = latency.as_millis() as u64;
            if response.status().is_success() {
                if latency > degraded_latency {
                    (HealthState::Degraded, Some(latency_ms), None)
                } else {
                    (HealthState::Healthy, Some(latency_ms), None)
                }
            } else {
                (
                    HealthState::Unhealthy,
                    Some(latency_ms),
                    Some(format!("status {}", response.status().as_u16())),
                )
            }
        }
        Err(e) => {
            let category = if e.is_timeout() {
                "timeout"
            } else if e.is_connect() {
                "connect"
            } else {
                "request"
            };
            (HealthState::Unhealthy, None, Some(category.to_string()))
        }
    };

    debug!(
        service_id = %service.id,
        status = %status,
        latency_ms = ?latency_ms,
        "Health probe completed"
    );

    HealthRecord {
        service_id: service.id.clone(),
        status,
        latency_ms,
        checked_at: Utc::now(),
        error,
    }
}

/// Runs the periodic probe loop under a supervisor that restarts it if it
/// ever panics. Probe failures themselves only update records.
pub fn spawn_probe_loop(aggregator: Arc<HealthAggregator>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let aggregator = aggregator.clone();
            let worker = tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    aggregator.probe_all().await;
                }
            });
            match worker.await {
                Err(e) if e.is_panic() => {
                    warn!("Health probe loop panicked; restarting");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                _ => break,
            }
        }
    })
}
