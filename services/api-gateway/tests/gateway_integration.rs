//! End-to-end gateway tests against mock upstreams.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{HeaderName, HeaderValue};
use axum_test::TestServer;
use jsonwebtoken::{encode, EncodingKey, Header};
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use api_gateway::build_gateway;
use api_gateway::ApiGatewayConfig;
use nimbus_shared::repository::{InMemoryServiceRepository, InMemoryTenantRepository};
use nimbus_shared::tenant::{Tenant, TenantPlan, TenantStatus};
use nimbus_shared::upstream::{RetryPolicy, UpstreamService};

const JWT_SECRET: &str = "development-secret-change-in-production";

fn upstream(id: &str, prefix: &str, base_url: &str) -> UpstreamService {
    UpstreamService {
        id: id.to_string(),
        base_url: base_url.to_string(),
        path_prefix: prefix.to_string(),
        host: None,
        allowed_methods: None,
        timeout_ms: 2_000,
        retry: RetryPolicy::default(),
        strip_prefix: true,
        strip_authorization: false,
        required_scopes: Vec::new(),
        health_path: "/health".to_string(),
        tags: Vec::new(),
    }
}

fn tenant(id: &str, rpm: u64) -> Tenant {
    let mut tenant = Tenant::new(id, id, TenantPlan::Premium).unwrap();
    tenant.limits.requests_per_minute = Some(rpm);
    tenant
}

async fn gateway(services: Vec<UpstreamService>, tenants: Vec<Tenant>) -> TestServer {
    let config = ApiGatewayConfig::development();
    let (app, _state) = build_gateway(
        config,
        Some(Arc::new(InMemoryTenantRepository::with_tenants(tenants))),
        Some(Arc::new(InMemoryServiceRepository::new(services))),
    )
    .await
    .unwrap();
    TestServer::new(app).unwrap()
}

fn h(name: &'static str) -> HeaderName {
    HeaderName::from_static(name)
}

fn admin_token(tenant_id: Option<&str>) -> String {
    let mut claims = serde_json::json!({
        "sub": "ops-1",
        "roles": ["admin"],
        "exp": chrono::Utc::now().timestamp() + 3_600,
        "iat": chrono::Utc::now().timestamp(),
    });
    if let Some(id) = tenant_id {
        claims["tenant_id"] = serde_json::json!(id);
    }
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap()
}

// Scenario: simple route. The upstream sees the stripped path, the
// injected tenant header, and a trace id; the client sees the upstream's
// response with rate-limit headers attached.
#[tokio::test]
async fn test_simple_route_forwards_with_prefix_stripped() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/events"))
        .and(header("x-tenant-id", "acme"))
        .and(header_exists("x-request-id"))
        .and(header_exists("x-gateway-trace"))
        .and(header_exists("x-forwarded-host"))
        .respond_with(ResponseTemplate::new(200).set_body_string("events!"))
        .expect(1)
        .mount(&mock)
        .await;

    let server = gateway(
        vec![upstream("analytics", "/analytics", &mock.uri())],
        vec![tenant("acme", 100)],
    )
    .await;

    let response = server
        .get("/analytics/events")
        .add_header(h("x-tenant-id"), HeaderValue::from_static("acme"))
        .await;

    eprintln!("DEBUG status={} body={}", response.status_code(), response.text());
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.text(), "events!");
    assert_eq!(
        response.headers().get("server").unwrap().to_str().unwrap(),
        "nimbus-gateway"
    );
    assert!(response.headers().get("x-ratelimit-limit").is_some());
    assert_eq!(
        response
            .headers()
            .get("x-ratelimit-remaining")
            .unwrap()
            .to_str()
            .unwrap(),
        "99"
    );
}

// Scenario: rate limit hit. Five admitted, the fifth shows zero
// remaining, the sixth rejects with Retry-After.
#[tokio::test]
async fn test_rate_limit_five_then_reject() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock)
        .await;

    let server = gateway(
        vec![upstream("analytics", "/analytics", &mock.uri())],
        vec![tenant("acme", 5)],
    )
    .await;

    for i in 1..=5 {
        let response = server
            .get("/analytics/e")
            .add_header(h("x-tenant-id"), HeaderValue::from_static("acme"))
            .await;
        assert_eq!(response.status_code(), 200, "request {} admitted", i);
        if i == 5 {
            assert_eq!(
                response
                    .headers()
                    .get("x-ratelimit-remaining")
                    .unwrap()
                    .to_str()
                    .unwrap(),
                "0"
            );
        }
    }

    let response = server
        .get("/analytics/e")
        .add_header(h("x-tenant-id"), HeaderValue::from_static("acme"))
        .await;
    assert_eq!(response.status_code(), 429);
    let retry_after: u64 = response
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after >= 1 && retry_after <= 60);

    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "RATE_LIMITED");
    assert!(body["error"]["trace_id"].is_string());
}

// Scenario: upstream timeout. First byte never arrives inside the
// service's 500ms budget; the client gets 504 promptly.
#[tokio::test]
async fn test_upstream_timeout_maps_to_504() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&mock)
        .await;

    let mut service = upstream("billing", "/billing", &mock.uri());
    service.timeout_ms = 500;

    let server = gateway(vec![service], vec![tenant("acme", 100)]).await;

    let started = Instant::now();
    let response = server
        .get("/billing/invoices")
        .add_header(h("x-tenant-id"), HeaderValue::from_static("acme"))
        .await;
    let elapsed = started.elapsed();

    assert_eq!(response.status_code(), 504);
    assert!(elapsed < Duration::from_millis(1_500), "took {:?}", elapsed);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "UPSTREAM_TIMEOUT");
}

// A transient 502 on a GET is retried and the second attempt's response
// wins.
#[tokio::test]
async fn test_get_retries_transient_502() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/x"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&mock)
        .await;
    Mock::given(method("GET"))
        .and(path("/x"))
        .respond_with(ResponseTemplate::new(200).set_body_string("second try"))
        .mount(&mock)
        .await;

    let mut service = upstream("svc", "/svc", &mock.uri());
    service.retry = RetryPolicy {
        attempts: 3,
        base_ms: 10,
    };

    let server = gateway(vec![service], vec![tenant("acme", 100)]).await;

    let response = server
        .get("/svc/x")
        .add_header(h("x-tenant-id"), HeaderValue::from_static("acme"))
        .await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(response.text(), "second try");
}

// POST is never retried: the transient 502 passes through.
#[tokio::test]
async fn test_post_is_not_retried() {
    let mock = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/x"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&mock)
        .await;
    Mock::given(method("POST"))
        .and(path("/x"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock)
        .await;

    let mut service = upstream("svc", "/svc", &mock.uri());
    service.retry = RetryPolicy {
        attempts: 3,
        base_ms: 10,
    };

    let server = gateway(vec![service], vec![tenant("acme", 100)]).await;

    let response = server
        .post("/svc/x")
        .add_header(h("x-tenant-id"), HeaderValue::from_static("acme"))
        .text("payload")
        .await;
    assert_eq!(response.status_code(), 502);
}

// Scenario: suspended tenant. 403 without touching the upstream.
#[tokio::test]
async fn test_suspended_tenant_never_reaches_upstream() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&mock)
        .await;

    let mut suspended = tenant("acme", 100);
    suspended.status = TenantStatus::Suspended;

    let server = gateway(
        vec![upstream("svc", "/svc", &mock.uri())],
        vec![suspended],
    )
    .await;

    let response = server
        .get("/svc/data")
        .add_header(h("x-tenant-id"), HeaderValue::from_static("acme"))
        .await;
    assert_eq!(response.status_code(), 403);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "TENANT_SUSPENDED");
}

// Disallowed method: 405 with Allow, no rate counter consumed.
#[tokio::test]
async fn test_method_not_allowed_skips_rate_counters() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock)
        .await;

    let mut service = upstream("svc", "/svc", &mock.uri());
    service.allowed_methods = Some(vec!["GET".to_string()]);

    let server = gateway(vec![service], vec![tenant("acme", 10)]).await;

    let response = server
        .post("/svc/x")
        .add_header(h("x-tenant-id"), HeaderValue::from_static("acme"))
        .await;
    assert_eq!(response.status_code(), 405);
    assert_eq!(
        response.headers().get("allow").unwrap().to_str().unwrap(),
        "GET"
    );

    // The rejected POST consumed nothing: a full budget remains.
    let response = server
        .get("/svc/x")
        .add_header(h("x-tenant-id"), HeaderValue::from_static("acme"))
        .await;
    assert_eq!(response.status_code(), 200);
    assert_eq!(
        response
            .headers()
            .get("x-ratelimit-remaining")
            .unwrap()
            .to_str()
            .unwrap(),
        "9"
    );
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let server = gateway(Vec::new(), vec![tenant("acme", 10)]).await;
    let response = server
        .get("/nowhere")
        .add_header(h("x-tenant-id"), HeaderValue::from_static("acme"))
        .await;
    assert_eq!(response.status_code(), 404);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "ROUTE_NOT_FOUND");
}

#[tokio::test]
async fn test_unknown_tenant_is_404() {
    let mock = MockServer::start().await;
    let server = gateway(vec![upstream("svc", "/svc", &mock.uri())], Vec::new()).await;

    let response = server.get("/svc/x").await;
    assert_eq!(response.status_code(), 404);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "TENANT_UNKNOWN");
}

#[tokio::test]
async fn test_gateway_health_endpoint_shape() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock)
        .await;

    let server = gateway(
        vec![upstream("svc", "/svc", &mock.uri())],
        vec![tenant("acme", 10)],
    )
    .await;

    let response = server.get("/_gateway/health").await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert!(body["overall"].is_string());
    assert!(body["services"]["svc"]["status"].is_string());
    assert!(body["uptime_s"].is_number());
}

#[tokio::test]
async fn test_admin_surface_requires_admin_role() {
    let server = gateway(Vec::new(), vec![tenant("acme", 10)]).await;

    // No token.
    let response = server.get("/_gateway/tenants").await;
    assert_eq!(response.status_code(), 401);

    // Token without the admin role.
    let token = encode(
        &Header::default(),
        &serde_json::json!({
            "sub": "user-1",
            "roles": ["viewer"],
            "exp": chrono::Utc::now().timestamp() + 3_600,
        }),
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    let response = server
        .get("/_gateway/tenants")
        .add_header(
            h("authorization"),
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        )
        .await;
    assert_eq!(response.status_code(), 403);

    // Admin role.
    let response = server
        .get("/_gateway/tenants")
        .add_header(
            h("authorization"),
            HeaderValue::from_str(&format!("Bearer {}", admin_token(None))).unwrap(),
        )
        .await;
    assert_eq!(response.status_code(), 200);
}

#[tokio::test]
async fn test_admin_tenant_crud_round_trip() {
    let server = gateway(Vec::new(), Vec::new()).await;
    let auth = HeaderValue::from_str(&format!("Bearer {}", admin_token(None))).unwrap();

    // Create.
    let response = server
        .post("/_gateway/tenants")
        .add_header(h("authorization"), auth.clone())
        .json(&serde_json::json!({
            "id": "acme",
            "name": "Acme Corp",
            "plan": "premium"
        }))
        .await;
    assert_eq!(response.status_code(), 201);

    // Duplicate id rejected, even after deletion later.
    let response = server
        .post("/_gateway/tenants")
        .add_header(h("authorization"), auth.clone())
        .json(&serde_json::json!({ "id": "acme", "name": "Other" }))
        .await;
    assert_eq!(response.status_code(), 400);

    // Patch.
    let response = server
        .patch("/_gateway/tenants/acme")
        .add_header(h("authorization"), auth.clone())
        .json(&serde_json::json!({ "status": "suspended" }))
        .await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "suspended");

    // Delete marks, never removes.
    let response = server
        .delete("/_gateway/tenants/acme")
        .add_header(h("authorization"), auth.clone())
        .await;
    assert_eq!(response.status_code(), 200);

    let response = server
        .get("/_gateway/tenants/acme")
        .add_header(h("authorization"), auth.clone())
        .await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "deleted");

    // The id stays reserved.
    let response = server
        .post("/_gateway/tenants")
        .add_header(h("authorization"), auth)
        .json(&serde_json::json!({ "id": "acme", "name": "Reborn" }))
        .await;
    assert_eq!(response.status_code(), 400);
}

#[tokio::test]
async fn test_suspended_admin_tenant_is_blocked() {
    let mut suspended = tenant("ops", 10);
    suspended.status = TenantStatus::Suspended;
    let server = gateway(Vec::new(), vec![suspended]).await;

    let response = server
        .get("/_gateway/tenants")
        .add_header(
            h("authorization"),
            HeaderValue::from_str(&format!("Bearer {}", admin_token(Some("ops")))).unwrap(),
        )
        .await;
    assert_eq!(response.status_code(), 403);
    let body: serde_json::Value = response.json();
    assert_eq!(body["error"]["code"], "TENANT_SUSPENDED");
}

#[tokio::test]
async fn test_required_scopes_enforced() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock)
        .await;

    let mut service = upstream("billing", "/billing", &mock.uri());
    service.required_scopes = vec!["billing:read".to_string()];

    let server = gateway(vec![service], vec![tenant("acme", 10)]).await;

    // No token at all: 401.
    let response = server
        .get("/billing/x")
        .add_header(h("x-tenant-id"), HeaderValue::from_static("acme"))
        .await;
    assert_eq!(response.status_code(), 401);

    // Token without the scope: 403.
    let token = encode(
        &Header::default(),
        &serde_json::json!({
            "sub": "user-1",
            "scopes": ["other:read"],
            "exp": chrono::Utc::now().timestamp() + 3_600,
        }),
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    let response = server
        .get("/billing/x")
        .add_header(h("x-tenant-id"), HeaderValue::from_static("acme"))
        .add_header(
            h("authorization"),
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        )
        .await;
    assert_eq!(response.status_code(), 403);

    // Token with the scope: forwarded.
    let token = encode(
        &Header::default(),
        &serde_json::json!({
            "sub": "user-1",
            "scopes": ["billing:read"],
            "exp": chrono::Utc::now().timestamp() + 3_600,
        }),
        &EncodingKey::from_secret(JWT_SECRET.as_bytes()),
    )
    .unwrap();
    let response = server
        .get("/billing/x")
        .add_header(h("x-tenant-id"), HeaderValue::from_static("acme"))
        .add_header(
            h("authorization"),
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        )
        .await;
    assert_eq!(response.status_code(), 200);
}

#[tokio::test]
async fn test_admin_service_reload_and_stats() {
    let mock = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&mock)
        .await;

    let server = gateway(
        vec![upstream("svc", "/svc", &mock.uri())],
        vec![tenant("acme", 100)],
    )
    .await;
    let auth = HeaderValue::from_str(&format!("Bearer {}", admin_token(None))).unwrap();

    // Drive one request through so stats have something to say.
    let response = server
        .get("/svc/x")
        .add_header(h("x-tenant-id"), HeaderValue::from_static("acme"))
        .await;
    assert_eq!(response.status_code(), 200);

    let response = server
        .post("/_gateway/services/reload")
        .add_header(h("authorization"), auth.clone())
        .await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["services"], 1);

    let response = server
        .get("/_gateway/stats")
        .add_header(h("authorization"), auth)
        .await;
    assert_eq!(response.status_code(), 200);
    let body: serde_json::Value = response.json();
    assert_eq!(body["requests_total"], 1);
    assert_eq!(body["per_tenant"]["acme"], 1);
    assert_eq!(body["per_service"]["svc"], 1);
}
