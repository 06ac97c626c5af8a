use std::net::SocketAddr;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::Claims;

// Common ID types
pub type TenantId = String;
pub type ServiceId = String;
pub type TraceId = String;

/// Health classification for a single upstream service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Unhealthy => "unhealthy",
            HealthState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One probe observation for one service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub service_id: ServiceId,
    pub status: HealthState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    pub checked_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl HealthRecord {
    pub fn unknown(service_id: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            status: HealthState::Unknown,
            latency_ms: None,
            checked_at: Utc::now(),
            error: None,
        }
    }
}

/// Per-request context, built once by the gateway front door and passed by
/// value through resolve -> rate-check -> route -> proxy. Never persisted.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tenant_id: TenantId,
    pub service_id: ServiceId,
    /// The matched path prefix.
    pub route: String,
    pub start_time: Instant,
    pub deadline: Instant,
    pub trace_id: TraceId,
    pub token_claims: Option<Claims>,
    pub client_addr: Option<SocketAddr>,
}

impl RequestContext {
    pub fn remaining(&self) -> std::time::Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }
}
