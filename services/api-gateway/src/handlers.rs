//! Gateway-local endpoints and the fallback proxy pipeline.
//!
//! Every non-reserved path runs route lookup -> method check -> tenant
//! resolution -> scope check -> concurrency cap -> rate check -> proxy, in
//! that order. A 405 or resolution failure never touches a rate counter
//! or an upstream.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderValue,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tracing::debug;

use nimbus_shared::auth::Claims;
use nimbus_shared::types::RequestContext;

use crate::auth::{extract_bearer_token, TokenVerifier};
use crate::config::ApiGatewayConfig;
use crate::error::{ApiGatewayError, ApiResult};
use crate::health::HealthAggregator;
use crate::metrics::{Metrics, StatsCollector};
use crate::middleware::TraceId;
use crate::proxy::UpstreamProxy;
use crate::rate_limiter::{ConcurrencyLimiter, Decision, RateLimiter};
use crate::registry::ServiceRegistry;
use crate::resolver::{TenantCatalog, TenantResolver};

/// Shared application state, wired once at startup and injected
/// everywhere; no global singletons.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ApiGatewayConfig>,
    pub registry: Arc<ServiceRegistry>,
    pub catalog: Arc<TenantCatalog>,
    pub resolver: Arc<TenantResolver>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub limiter: Arc<RateLimiter>,
    pub concurrency: Arc<ConcurrencyLimiter>,
    pub proxy: Arc<UpstreamProxy>,
    pub health: Arc<HealthAggregator>,
    pub metrics: Arc<Metrics>,
    pub stats: Arc<StatsCollector>,
    pub started_at: Instant,
}

/// Composite health view.
pub async fn gateway_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let snapshot = state.health.snapshot();
    let mut services = serde_json::Map::new();
    for (id, record) in snapshot {
        services.insert(
            id,
            json!({
                "status": record.status,
                "latency_ms": record.latency_ms,
                "checked_at": record.checked_at,
                "error": record.error,
            }),
        );
    }
    Json(json!({
        "overall": state.health.overall(),
        "services": services,
        "uptime_s": state.started_at.elapsed().as_secs(),
    }))
}

/// Prometheus text exposition.
pub async fn gateway_metrics(State(state): State<AppState>) -> Response {
    let body = state.metrics.encode();
    (
        [("content-type", "text/plain; version=0.0.4")],
        body,
    )
        .into_response()
}

/// Catch-all: proxies everything outside `/_gateway/` to the matched
/// upstream.
pub async fn proxy_handler(State(state): State<AppState>, request: Request) -> Response {
    let trace_id = request
        .extensions()
        .get::<TraceId>()
        .cloned()
        .unwrap_or_else(TraceId::generate);

    let method = request.method().as_str().to_string();
    let started = Instant::now();

    match handle_proxy(&state, &trace_id, request).await {
        Ok(ProxyOutcome {
            response,
            tenant_id,
            service_id,
        }) => {
            let status = response.status().as_u16();
            let outcome = if status >= 500 { "upstream_error" } else { "ok" };
            let duration_ms = started.elapsed().as_millis() as u64;
            state
                .metrics
                .record_request(&tenant_id, &service_id, &method, status, outcome, duration_ms);
            state.stats.record(&tenant_id, &service_id, status, duration_ms);
            response
        }
        Err(RejectedRequest {
            error,
            tenant_id,
            service_id,
        }) => {
            let status = error.status_code().as_u16();
            let duration_ms = started.elapsed().as_millis() as u64;
            state.metrics.record_request(
                tenant_id.as_deref().unwrap_or("unknown"),
                service_id.as_deref().unwrap_or("unknown"),
                &method,
                status,
                error.outcome(),
                duration_ms,
            );
            state.stats.record(
                tenant_id.as_deref().unwrap_or("unknown"),
                service_id.as_deref().unwrap_or("unknown"),
                status,
                duration_ms,
            );
            error.into_response_with_trace(&trace_id.0)
        }
    }
}

struct ProxyOutcome {
    response: Response,
    tenant_id: String,
    service_id: String,
}

struct RejectedRequest {
    error: ApiGatewayError,
    tenant_id: Option<String>,
    service_id: Option<String>,
}

impl RejectedRequest {
    fn early(error: ApiGatewayError) -> Self {
        Self {
            error,
            tenant_id: None,
            service_id: None,
        }
    }
}

async fn handle_proxy(
    state: &AppState,
    trace_id: &TraceId,
    request: Request,
) -> Result<ProxyOutcome, RejectedRequest> {
    let host = request
        .headers()
        .get("host")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("")
        .to_string();
    let path = request.uri().path().to_string();
    let method = request.method().clone();

    // Route decision: a pure function of (host, path, registry snapshot).
    let route = state
        .registry
        .lookup_by_path(&host, &path)
        .ok_or_else(|| RejectedRequest::early(ApiGatewayError::RouteNotFound { path: path.clone() }))?;
    let service = route.service.clone();

    // Method gate before anything counts.
    if !service.allows_method(method.as_str()) {
        let allow = service.allowed_methods.clone().unwrap_or_default();
        return Err(RejectedRequest {
            error: ApiGatewayError::MethodNotAllowed { allow },
            tenant_id: None,
            service_id: Some(service.id.clone()),
        });
    }

    // Verified claims, when a bearer token is present. Invalid tokens are
    // rejected outright rather than silently downgraded to anonymous.
    let auth_header = request
        .headers()
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .map(|h| h.to_string());
    let claims = match verify_bearer(state, auth_header.as_deref()).await {
        Ok(claims) => claims,
        Err(error) => {
            return Err(RejectedRequest {
                error,
                tenant_id: None,
                service_id: Some(service.id.clone()),
            })
        }
    };

    // Tenant resolution is terminal on failure; a suspended tenant never
    // reaches an upstream.
    let header_tenant = request
        .headers()
        .get("x-tenant-id")
        .and_then(|h| h.to_str().ok());
    let resolution = state
        .resolver
        .resolve(header_tenant, &host, claims.as_ref())
        .map_err(|error| {
            let error = match error {
                ApiGatewayError::TenantUnknown { .. }
                    if !service.required_scopes.is_empty() && claims.is_none() =>
                {
                    ApiGatewayError::AuthInvalid {
                        message: "authentication required".to_string(),
                    }
                }
                other => other,
            };
            RejectedRequest {
                error,
                tenant_id: None,
                service_id: Some(service.id.clone()),
            }
        })?;
    let tenant = resolution.tenant;

    // Scope gate.
    if !service.required_scopes.is_empty() {
        let err = match &claims {
            None => Some(ApiGatewayError::AuthInvalid {
                message: "authentication required".to_string(),
            }),
            Some(claims) => service
                .required_scopes
                .iter()
                .find(|scope| !claims.has_scope(scope))
                .map(|scope| ApiGatewayError::AuthForbidden {
                    message: format!("missing scope '{}'", scope),
                }),
        };
        if let Some(error) = err {
            return Err(RejectedRequest {
                error,
                tenant_id: Some(tenant.id.clone()),
                service_id: Some(service.id.clone()),
            });
        }
    }

    let limits = tenant.resolved_limits();
    let reject = |error| RejectedRequest {
        error,
        tenant_id: Some(tenant.id.clone()),
        service_id: Some(service.id.clone()),
    };

    // Per-tenant concurrency cap.
    let permit = state
        .concurrency
        .try_acquire(&tenant.id, limits.concurrent_requests)
        .ok_or_else(|| {
            reject(ApiGatewayError::RateLimited {
                reason: "concurrent request cap reached".to_string(),
                retry_after: 1,
            })
        })?;

    // Windowed rate check; all three windows consumed atomically.
    let admit = match state
        .limiter
        .check_and_consume(&tenant.id, &service.id, &limits)
        .await
    {
        Decision::Admit(info) => info,
        Decision::Reject {
            reason,
            retry_after,
        } => {
            return Err(reject(ApiGatewayError::RateLimited {
                reason,
                retry_after,
            }))
        }
    };
    if admit.degraded {
        state.metrics.rate_limit_fail_open_total.inc();
    }

    let client_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0);

    let now = Instant::now();
    let ctx = RequestContext {
        tenant_id: tenant.id.clone(),
        service_id: service.id.clone(),
        route: route.matched_prefix.clone(),
        start_time: now,
        deadline: now + state.config.request_timeout(),
        trace_id: trace_id.0.clone(),
        token_claims: claims,
        client_addr,
    };

    debug!(
        tenant_id = %ctx.tenant_id,
        service_id = %ctx.service_id,
        strategy = resolution.strategy.as_str(),
        route = %ctx.route,
        trace_id = %ctx.trace_id,
        "Request admitted"
    );

    let mut response = state
        .proxy
        .forward(&ctx, &service, request, Some(permit))
        .await
        .map_err(|error| RejectedRequest {
            error,
            tenant_id: Some(tenant.id.clone()),
            service_id: Some(service.id.clone()),
        })?;

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&admit.limit.to_string()) {
        headers.insert("x-ratelimit-limit", value);
    }
    if let Ok(value) = HeaderValue::from_str(&admit.remaining.to_string()) {
        headers.insert("x-ratelimit-remaining", value);
    }
    if let Ok(value) = HeaderValue::from_str(&admit.reset_secs.to_string()) {
        headers.insert("x-ratelimit-reset", value);
    }

    Ok(ProxyOutcome {
        response,
        tenant_id: tenant.id,
        service_id: service.id.clone(),
    })
}

/// Verifies the Authorization header when present. Absence is not an
/// error at this layer; auth-required routes are gated on scopes later.
async fn verify_bearer(state: &AppState, auth_header: Option<&str>) -> ApiResult<Option<Claims>> {
    let Some(header) = auth_header else {
        return Ok(None);
    };
    let token = extract_bearer_token(header)?.to_string();
    let claims = state.verifier.verify(&token).await?;
    Ok(Some(claims))
}
