use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::Next,
    response::Response,
};
use tracing::info;
use uuid::Uuid;

/// Trace id carried through request extensions; reused as X-Request-ID.
#[derive(Debug, Clone)]
pub struct TraceId(pub String);

impl TraceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

/// Adopts the inbound X-Request-ID or generates one, and echoes it on the
/// response.
pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let trace_id = request
        .headers()
        .get("x-request-id")
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.is_empty() && s.len() <= 128)
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    request.extensions_mut().insert(TraceId(trace_id.clone()));

    let mut response = next.run(request).await;

    response.headers_mut().insert(
        "x-request-id",
        HeaderValue::from_str(&trace_id).unwrap_or_else(|_| HeaderValue::from_static("invalid")),
    );

    response
}

/// Request start/completion logs with duration and trace id.
pub async fn logging_middleware(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let start_time = std::time::Instant::now();

    let trace_id = request
        .extensions()
        .get::<TraceId>()
        .map(|t| t.0.clone())
        .unwrap_or_else(|| "unknown".to_string());

    let response = next.run(request).await;
    let duration = start_time.elapsed();

    info!(
        method = %method,
        path = %path,
        trace_id = %trace_id,
        status = %response.status(),
        duration_ms = duration.as_millis() as u64,
        "Request completed"
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::StatusCode, middleware, routing::get, Router};
    use axum_test::TestServer;

    async fn echo_trace(request: Request) -> String {
        request
            .extensions()
            .get::<TraceId>()
            .map(|t| t.0.clone())
            .unwrap_or_default()
    }

    fn app() -> Router {
        Router::new()
            .route("/", get(echo_trace))
            .layer(middleware::from_fn(request_id_middleware))
    }

    #[tokio::test]
    async fn test_inbound_request_id_is_adopted() {
        let server = TestServer::new(app()).unwrap();
        let response = server
            .get("/")
            .add_header(
                axum::http::HeaderName::from_static("x-request-id"),
                axum::http::HeaderValue::from_static("trace-abc"),
            )
            .await;

        assert_eq!(response.status_code(), StatusCode::OK);
        assert_eq!(response.text(), "trace-abc");
        assert_eq!(
            response.headers().get("x-request-id").unwrap(),
            &HeaderValue::from_static("trace-abc")
        );
    }

    #[tokio::test]
    async fn test_request_id_generated_when_absent() {
        let server = TestServer::new(app()).unwrap();
        let response = server.get("/").await;

        let body = response.text();
        assert!(!body.is_empty());
        assert_eq!(
            response.headers().get("x-request-id").unwrap().to_str().unwrap(),
            body
        );
    }

    #[tokio::test]
    async fn test_empty_request_id_is_replaced() {
        let server = TestServer::new(app()).unwrap();
        let response = server
            .get("/")
            .add_header(
                axum::http::HeaderName::from_static("x-request-id"),
                axum::http::HeaderValue::from_static(""),
            )
            .await;
        assert!(!response.text().is_empty());
    }
}
