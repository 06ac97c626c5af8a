//! Administrative surface under `/_gateway/`.
//!
//! Every operation here requires a verified bearer token carrying the
//! `admin` role. An admin whose own tenant is suspended or deleted is
//! blocked like any other caller. Mutations are last-writer-wins with a
//! bumped `updated_at`, and the resolver catalog is refreshed after each
//! one so the data plane observes changes promptly.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use nimbus_shared::auth::Claims;
use nimbus_shared::tenant::{
    validate_custom_domains, validate_tenant_id, Tenant, TenantLimits, TenantPlan, TenantStatus,
};
use nimbus_shared::types::TenantId;

use crate::auth::extract_bearer_token;
use crate::error::{ApiGatewayError, ApiResult};
use crate::handlers::AppState;
use crate::middleware::TraceId;

async fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<Claims> {
    let header = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ApiGatewayError::AuthInvalid {
            message: "missing bearer token".to_string(),
        })?;
    let token = extract_bearer_token(header)?;
    let claims = state.verifier.verify(token).await?;

    if !claims.has_role("admin") {
        return Err(ApiGatewayError::AuthForbidden {
            message: "admin role required".to_string(),
        });
    }

    // Admin operations from a non-active tenant are blocked.
    if let Some(tenant_id) = claims.tenant_claim() {
        if let Some(tenant) = state.catalog.get(tenant_id) {
            match tenant.status {
                TenantStatus::Active => {}
                TenantStatus::Suspended => {
                    return Err(ApiGatewayError::TenantSuspended {
                        tenant_id: tenant.id,
                    })
                }
                TenantStatus::Deleted => {
                    return Err(ApiGatewayError::AuthForbidden {
                        message: "tenant no longer exists".to_string(),
                    })
                }
            }
        }
    }

    Ok(claims)
}

fn trace_of(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|h| h.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| TraceId::generate().0)
}

/// Wraps a fallible admin handler body so errors carry the request trace.
macro_rules! admin_endpoint {
    ($headers:expr, $body:expr) => {
        match $body {
            Ok(response) => response.into_response(),
            Err(error) => error.into_response_with_trace(&trace_of($headers)),
        }
    };
}

#[derive(Debug, Deserialize)]
pub struct CreateTenantRequest {
    pub id: TenantId,
    pub name: String,
    #[serde(default)]
    pub plan: TenantPlan,
    #[serde(default)]
    pub limits: TenantLimits,
    #[serde(default)]
    pub custom_domains: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TenantPatch {
    pub name: Option<String>,
    pub status: Option<TenantStatus>,
    pub plan: Option<TenantPlan>,
    pub limits: Option<TenantLimits>,
    pub custom_domains: Option<Vec<String>>,
}

pub async fn list_tenants(State(state): State<AppState>, headers: HeaderMap) -> Response {
    admin_endpoint!(&headers, list_tenants_inner(&state, &headers).await)
}

async fn list_tenants_inner(state: &AppState, headers: &HeaderMap) -> ApiResult<Json<Vec<Tenant>>> {
    require_admin(state, headers).await?;
    let tenants = state.catalog.repository().list().await?;
    Ok(Json(tenants))
}

pub async fn get_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    admin_endpoint!(&headers, get_tenant_inner(&state, &headers, &id).await)
}

async fn get_tenant_inner(
    state: &AppState,
    headers: &HeaderMap,
    id: &str,
) -> ApiResult<Json<Tenant>> {
    require_admin(state, headers).await?;
    let tenant = state.catalog.repository().get(&id.to_string()).await?.ok_or_else(|| {
        ApiGatewayError::TenantUnknown {
            message: format!("tenant '{}'", id),
        }
    })?;
    Ok(Json(tenant))
}

pub async fn create_tenant(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateTenantRequest>,
) -> Response {
    admin_endpoint!(&headers, create_tenant_inner(&state, &headers, body).await)
}

async fn create_tenant_inner(
    state: &AppState,
    headers: &HeaderMap,
    body: CreateTenantRequest,
) -> ApiResult<(axum::http::StatusCode, Json<Tenant>)> {
    let claims = require_admin(state, headers).await?;

    validate_tenant_id(&body.id)?;
    let repo = state.catalog.repository();
    // Ids are never reused: a deleted tenant still owns its id.
    if repo.get(&body.id).await?.is_some() {
        return Err(ApiGatewayError::InvalidRequest {
            message: format!("tenant id '{}' already exists", body.id),
        });
    }

    let mut tenant = Tenant::new(&body.id, &body.name, body.plan)?;
    tenant.limits = body.limits;
    tenant.custom_domains = body.custom_domains;

    let mut all = repo.list().await?;
    all.push(tenant.clone());
    validate_custom_domains(&all)?;

    let created = repo.upsert(&tenant).await?;
    let _ = state.catalog.refresh().await;

    info!(tenant_id = %created.id, admin = %claims.sub, "Tenant created");
    Ok((axum::http::StatusCode::CREATED, Json(created)))
}

pub async fn update_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(patch): Json<TenantPatch>,
) -> Response {
    admin_endpoint!(&headers, update_tenant_inner(&state, &headers, &id, patch).await)
}

async fn update_tenant_inner(
    state: &AppState,
    headers: &HeaderMap,
    id: &str,
    patch: TenantPatch,
) -> ApiResult<Json<Tenant>> {
    let claims = require_admin(state, headers).await?;

    let repo = state.catalog.repository();
    let mut tenant = repo.get(&id.to_string()).await?.ok_or_else(|| {
        ApiGatewayError::TenantUnknown {
            message: format!("tenant '{}'", id),
        }
    })?;

    if let Some(name) = patch.name {
        tenant.name = name;
    }
    if let Some(status) = patch.status {
        tenant.status = status;
    }
    if let Some(plan) = patch.plan {
        tenant.plan = plan;
    }
    if let Some(limits) = patch.limits {
        tenant.limits = limits;
    }
    if let Some(custom_domains) = patch.custom_domains {
        tenant.custom_domains = custom_domains;
    }
    tenant.updated_at = Utc::now();

    let mut all: Vec<Tenant> = repo
        .list()
        .await?
        .into_iter()
        .filter(|t| t.id != tenant.id)
        .collect();
    all.push(tenant.clone());
    validate_custom_domains(&all)?;

    let updated = repo.upsert(&tenant).await?;
    let _ = state.catalog.refresh().await;

    info!(tenant_id = %updated.id, admin = %claims.sub, "Tenant updated");
    Ok(Json(updated))
}

pub async fn delete_tenant(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    admin_endpoint!(&headers, delete_tenant_inner(&state, &headers, &id).await)
}

async fn delete_tenant_inner(
    state: &AppState,
    headers: &HeaderMap,
    id: &str,
) -> ApiResult<Json<serde_json::Value>> {
    let claims = require_admin(state, headers).await?;
    state.catalog.repository().delete(&id.to_string()).await?;
    let _ = state.catalog.refresh().await;

    info!(tenant_id = %id, admin = %claims.sub, "Tenant deleted");
    Ok(Json(json!({ "id": id, "status": "deleted" })))
}

pub async fn list_services(State(state): State<AppState>, headers: HeaderMap) -> Response {
    admin_endpoint!(&headers, list_services_inner(&state, &headers).await)
}

async fn list_services_inner(
    state: &AppState,
    headers: &HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(state, headers).await?;
    let services: Vec<_> = state
        .registry
        .list()
        .iter()
        .map(|s| s.as_ref().clone())
        .collect();
    Ok(Json(json!({ "services": services })))
}

pub async fn get_service(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    admin_endpoint!(&headers, get_service_inner(&state, &headers, &id).await)
}

async fn get_service_inner(
    state: &AppState,
    headers: &HeaderMap,
    id: &str,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(state, headers).await?;
    let service = state
        .registry
        .get(id)
        .ok_or_else(|| ApiGatewayError::RouteNotFound {
            path: format!("/_gateway/services/{}", id),
        })?;
    Ok(Json(json!({
        "service": service.as_ref(),
        "health": state.health.status(id),
    })))
}

pub async fn reload_services(State(state): State<AppState>, headers: HeaderMap) -> Response {
    admin_endpoint!(&headers, reload_services_inner(&state, &headers).await)
}

async fn reload_services_inner(
    state: &AppState,
    headers: &HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    let claims = require_admin(state, headers).await?;
    let count = state.registry.reload().await?;
    info!(services = count, admin = %claims.sub, "Service registry reloaded via admin");
    Ok(Json(json!({ "reloaded": true, "services": count })))
}

pub async fn stats_overview(State(state): State<AppState>, headers: HeaderMap) -> Response {
    admin_endpoint!(&headers, stats_overview_inner(&state, &headers).await)
}

async fn stats_overview_inner(
    state: &AppState,
    headers: &HeaderMap,
) -> ApiResult<Json<serde_json::Value>> {
    require_admin(state, headers).await?;
    let overview = state.stats.overview(state.limiter.fail_open_events());
    Ok(Json(serde_json::to_value(overview).map_err(|e| {
        ApiGatewayError::Internal {
            message: e.to_string(),
        }
    })?))
}

pub async fn service_health(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.health.status(&id) {
        Some(record) => Json(record).into_response(),
        None => ApiGatewayError::RouteNotFound {
            path: format!("/_gateway/health/{}", id),
        }
        .into_response(),
    }
}

pub async fn service_health_history(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Response {
    match state.health.history(&id) {
        Some(records) => Json(json!({ "service_id": id, "history": records })).into_response(),
        None => ApiGatewayError::RouteNotFound {
            path: format!("/_gateway/health/history/{}", id),
        }
        .into_response(),
    }
}

pub async fn check_service_health(
    State(state): State<AppState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    admin_endpoint!(&headers, check_service_health_inner(&state, &headers, &id).await)
}

async fn check_service_health_inner(
    state: &AppState,
    headers: &HeaderMap,
    id: &str,
) -> ApiResult<Json<nimbus_shared::types::HealthRecord>> {
    require_admin(state, headers).await?;
    let record = state.health.check_now(id).await?;
    Ok(Json(record))
}
