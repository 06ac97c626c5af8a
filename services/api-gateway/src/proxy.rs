//! Upstream forwarding.
//!
//! Streams request and response bodies, rewrites the header sets the
//! gateway owns, enforces the end-to-end deadline (first byte within
//! min(service timeout, remaining request deadline), mid-stream stalls
//! close the connection), and retries idempotent requests on connection
//! errors or 502/503/504 responses whose body has not started streaming.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::Request;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use futures::stream::BoxStream;
use futures::{Future, Stream, StreamExt};
use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use nimbus_shared::types::{RequestContext, ServiceId};
use nimbus_shared::upstream::{RetryPolicy, UpstreamService};

use crate::config::UpstreamConfig;
use crate::error::{ApiGatewayError, ApiResult};
use crate::metrics::Metrics;
use crate::rate_limiter::ConcurrencyPermit;

/// Value written into the Server response header.
pub const GATEWAY_SERVER: &str = "nimbus-gateway";

pub fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "trailers"
            | "transfer-encoding"
            | "upgrade"
    )
}

/// Methods safe to retry automatically.
pub fn is_idempotent(method: &Method) -> bool {
    matches!(
        method.as_str(),
        "GET" | "HEAD" | "PUT" | "DELETE" | "OPTIONS"
    )
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 502 | 503 | 504)
}

/// Removes the matched prefix when the service asks for it. The upstream
/// always receives a path with a leading slash.
pub fn rewrite_path(path: &str, matched_prefix: &str, strip_prefix: bool) -> String {
    if !strip_prefix || matched_prefix == "/" {
        return path.to_string();
    }
    let stripped = path.strip_prefix(matched_prefix).unwrap_or(path);
    if stripped.is_empty() {
        "/".to_string()
    } else if stripped.starts_with('/') {
        stripped.to_string()
    } else {
        format!("/{}", stripped)
    }
}

/// Exponential backoff with +/-25% jitter, capped.
fn backoff_delay(policy: &RetryPolicy, retry_number: u32, cap: Duration) -> Duration {
    let base = policy.base_ms as f64 * 2f64.powi(retry_number.saturating_sub(1) as i32);
    let jitter = rand::thread_rng().gen_range(0.75..=1.25);
    Duration::from_millis((base * jitter) as u64).min(cap)
}

/// Request body prepared for forwarding. Only fully buffered bodies can be
/// replayed on retry.
enum OutboundBody {
    Empty,
    Buffered(Bytes),
    Streamed(Option<reqwest::Body>),
}

impl OutboundBody {
    fn replayable(&self) -> bool {
        !matches!(self, OutboundBody::Streamed(_))
    }

    fn take_for_attempt(&mut self) -> Option<reqwest::Body> {
        match self {
            OutboundBody::Empty => None,
            OutboundBody::Buffered(bytes) => Some(reqwest::Body::from(bytes.clone())),
            OutboundBody::Streamed(body) => body.take(),
        }
    }
}

/// Counts request-body bytes as they stream to the upstream.
struct CountedRequestStream {
    inner: BoxStream<'static, Result<Bytes, axum::Error>>,
    counter: prometheus::IntCounter,
}

impl Stream for CountedRequestStream {
    type Item = Result<Bytes, axum::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.counter.inc_by(chunk.len() as u64);
                Poll::Ready(Some(Ok(chunk)))
            }
            other => other,
        }
    }
}

/// Client-facing response body: streams upstream bytes, enforces the
/// mid-stream deadline, counts bytes, and holds the per-upstream
/// in-flight permit until the body completes.
struct ResponseStream {
    inner: BoxStream<'static, reqwest::Result<Bytes>>,
    deadline: Pin<Box<tokio::time::Sleep>>,
    counter: prometheus::IntCounter,
    _upstream_permit: OwnedSemaphorePermit,
    _tenant_permit: Option<ConcurrencyPermit>,
}

impl Stream for ResponseStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.deadline.as_mut().poll(cx).is_ready() {
            // Streaming already began: the connection is torn down rather
            // than rewritten into an error response.
            return Poll::Ready(Some(Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "upstream response deadline exceeded",
            ))));
        }
        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.counter.inc_by(chunk.len() as u64);
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                e,
            )))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

pub struct UpstreamProxy {
    client: reqwest::Client,
    config: UpstreamConfig,
    debug_headers: bool,
    metrics: Arc<Metrics>,
    in_flight: Mutex<HashMap<ServiceId, Arc<Semaphore>>>,
}

impl UpstreamProxy {
    pub fn new(
        config: UpstreamConfig,
        debug_headers: bool,
        metrics: Arc<Metrics>,
    ) -> ApiResult<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.max_idle_conns)
            .build()
            .map_err(|e| ApiGatewayError::ConfigInvalid {
                message: format!("failed to build upstream HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            config,
            debug_headers,
            metrics,
            in_flight: Mutex::new(HashMap::new()),
        })
    }

    fn semaphore_for(&self, service_id: &str) -> Arc<Semaphore> {
        let mut map = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        map.entry(service_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_in_flight)))
            .clone()
    }

    /// Forwards an admitted request and streams the upstream response
    /// back. The caller's per-tenant concurrency permit is held until the
    /// response body completes.
    pub async fn forward(
        &self,
        ctx: &RequestContext,
        service: &UpstreamService,
        request: Request,
        tenant_permit: Option<ConcurrencyPermit>,
    ) -> ApiResult<Response> {
        let permit = match tokio::time::timeout(
            Duration::from_millis(self.config.acquire_timeout_ms),
            self.semaphore_for(&service.id).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(ApiGatewayError::Internal {
                    message: "upstream semaphore closed".to_string(),
                })
            }
            Err(_) => {
                return Err(ApiGatewayError::UpstreamBusy {
                    service: service.id.clone(),
                    retry_after: 1,
                })
            }
        };

        let (parts, body) = request.into_parts();
        let method = parts.method.clone();
        let upstream_path = rewrite_path(parts.uri.path(), &ctx.route, service.strip_prefix);
        let url = match parts.uri.query() {
            Some(query) => format!(
                "{}{}?{}",
                service.base_url.trim_end_matches('/'),
                upstream_path,
                query
            ),
            None => format!(
                "{}{}",
                service.base_url.trim_end_matches('/'),
                upstream_path
            ),
        };

        let headers = self.build_upstream_headers(ctx, service, &parts.headers)?;

        let retry_eligible = is_idempotent(&method) && service.retry.attempts > 1;
        let bytes_in = self
            .metrics
            .bytes_in_total
            .with_label_values(&[ctx.tenant_id.as_str(), service.id.as_str()]);
        let mut outbound_body = prepare_body(
            body,
            retry_eligible,
            self.config.retry_body_cap_bytes,
            bytes_in,
        )
        .await?;

        // First byte must arrive within min(service timeout, remaining
        // request deadline).
        let budget = service.timeout().min(ctx.remaining());
        let first_byte_deadline = Instant::now() + budget;

        let max_attempts = if retry_eligible && outbound_body.replayable() {
            service.retry.attempts
        } else {
            1
        };

        let mut attempt: u32 = 0;
        let response = loop {
            attempt += 1;
            let remaining = first_byte_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ApiGatewayError::UpstreamTimeout {
                    service: service.id.clone(),
                });
            }

            let reqwest_method = reqwest::Method::from_bytes(method.as_str().as_bytes())
                .map_err(|e| ApiGatewayError::Internal {
                    message: format!("invalid HTTP method: {}", e),
                })?;
            let mut upstream_request = self
                .client
                .request(reqwest_method, &url)
                .headers(headers.clone());
            if let Some(body) = outbound_body.take_for_attempt() {
                upstream_request = upstream_request.body(body);
            }

            match tokio::time::timeout(remaining, upstream_request.send()).await {
                // Timed out waiting for response headers: the budget is
                // spent, so this is terminal regardless of retry policy.
                Err(_) => {
                    return Err(ApiGatewayError::UpstreamTimeout {
                        service: service.id.clone(),
                    })
                }
                Ok(Err(e)) => {
                    let retryable = e.is_connect() || e.is_timeout();
                    if retryable && attempt < max_attempts {
                        self.backoff(service, attempt, first_byte_deadline).await?;
                        continue;
                    }
                    warn!(
                        service_id = %service.id,
                        trace_id = %ctx.trace_id,
                        attempt = attempt,
                        error = %e,
                        "Upstream request failed"
                    );
                    return Err(if e.is_timeout() {
                        ApiGatewayError::UpstreamTimeout {
                            service: service.id.clone(),
                        }
                    } else {
                        ApiGatewayError::UpstreamUnavailable {
                            service: service.id.clone(),
                            message: "connection failed".to_string(),
                        }
                    });
                }
                Ok(Ok(response)) => {
                    let status = response.status().as_u16();
                    // No response byte has been read yet, so a retryable
                    // 5xx can still be replayed.
                    if is_retryable_status(status) && attempt < max_attempts {
                        debug!(
                            service_id = %service.id,
                            trace_id = %ctx.trace_id,
                            status = status,
                            attempt = attempt,
                            "Retrying upstream 5xx"
                        );
                        self.backoff(service, attempt, first_byte_deadline).await?;
                        continue;
                    }
                    break response;
                }
            }
        };

        info!(
            service_id = %service.id,
            tenant_id = %ctx.tenant_id,
            trace_id = %ctx.trace_id,
            status = response.status().as_u16(),
            attempts = attempt,
            duration_ms = ctx.elapsed_ms(),
            "Upstream responded"
        );

        self.build_client_response(ctx, service, response, permit, tenant_permit)
    }

    async fn backoff(
        &self,
        service: &UpstreamService,
        retry_number: u32,
        deadline: Instant,
    ) -> ApiResult<()> {
        self.metrics
            .retries_total
            .with_label_values(&[service.id.as_str()])
            .inc();
        let delay = backoff_delay(&service.retry, retry_number, service.timeout());
        if Instant::now() + delay >= deadline {
            return Err(ApiGatewayError::UpstreamTimeout {
                service: service.id.clone(),
            });
        }
        tokio::time::sleep(delay).await;
        Ok(())
    }

    fn build_upstream_headers(
        &self,
        ctx: &RequestContext,
        service: &UpstreamService,
        inbound: &HeaderMap,
    ) -> ApiResult<reqwest::header::HeaderMap> {
        let mut headers = reqwest::header::HeaderMap::new();

        for (name, value) in inbound {
            let name_str = name.as_str();
            if is_hop_by_hop_header(name_str) {
                continue;
            }
            // Headers the gateway owns outright.
            if matches!(
                name_str,
                "host"
                    | "content-length"
                    | "x-tenant-id"
                    | "x-request-id"
                    | "x-forwarded-for"
                    | "x-forwarded-proto"
                    | "x-forwarded-host"
                    | "x-gateway-trace"
            ) {
                continue;
            }
            if name_str == "authorization" && service.strip_authorization {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name_str.as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }

        let mut set = |name: &'static str, value: &str| {
            if let Ok(value) = reqwest::header::HeaderValue::from_str(value) {
                headers.insert(name, value);
            }
        };

        set("x-tenant-id", &ctx.tenant_id);
        set("x-request-id", &ctx.trace_id);
        set("x-gateway-trace", &ctx.trace_id);

        let forwarded_for = {
            let prior = inbound
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok());
            let client_ip = ctx.client_addr.map(|a| a.ip().to_string());
            match (prior, client_ip) {
                (Some(prior), Some(ip)) => format!("{}, {}", prior, ip),
                (Some(prior), None) => prior.to_string(),
                (None, Some(ip)) => ip,
                (None, None) => String::new(),
            }
        };
        if !forwarded_for.is_empty() {
            set("x-forwarded-for", &forwarded_for);
        }

        let proto = inbound
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("http");
        set("x-forwarded-proto", proto);

        if let Some(host) = inbound.get("host").and_then(|v| v.to_str().ok()) {
            set("x-forwarded-host", host);
        }

        Ok(headers)
    }

    fn build_client_response(
        &self,
        ctx: &RequestContext,
        service: &UpstreamService,
        response: reqwest::Response,
        upstream_permit: OwnedSemaphorePermit,
        tenant_permit: Option<ConcurrencyPermit>,
    ) -> ApiResult<Response> {
        let status = StatusCode::from_u16(response.status().as_u16()).map_err(|e| {
            ApiGatewayError::Internal {
                message: format!("invalid upstream status: {}", e),
            }
        })?;

        let mut builder = Response::builder().status(status);
        for (name, value) in response.headers() {
            let name_str = name.as_str();
            if is_hop_by_hop_header(name_str) || name_str == "server" {
                continue;
            }
            builder = builder.header(name_str, value.as_bytes());
        }
        builder = builder.header("server", GATEWAY_SERVER);
        if self.debug_headers {
            builder = builder.header("x-gateway-upstream", service.id.as_str());
        }

        let bytes_out = self
            .metrics
            .bytes_out_total
            .with_label_values(&[ctx.tenant_id.as_str(), service.id.as_str()]);
        let stream = ResponseStream {
            inner: response.bytes_stream().boxed(),
            deadline: Box::pin(tokio::time::sleep_until(
                tokio::time::Instant::from_std(ctx.deadline),
            )),
            counter: bytes_out,
            _upstream_permit: upstream_permit,
            _tenant_permit: tenant_permit,
        };

        builder
            .body(Body::from_stream(stream))
            .map_err(|e| ApiGatewayError::Internal {
                message: format!("failed to build response: {}", e),
            })
    }
}

/// Reads the request body into a replayable form when retries are on the
/// table; otherwise streams it through untouched. Bodies that outgrow the
/// cap fall back to streaming (and give up retry eligibility).
async fn prepare_body(
    body: Body,
    retry_eligible: bool,
    cap: usize,
    counter: prometheus::IntCounter,
) -> ApiResult<OutboundBody> {
    let mut stream = body.into_data_stream();

    if !retry_eligible {
        // Peek one chunk so body-less requests go out without a body at
        // all instead of an empty chunked stream.
        return match stream.next().await {
            None => Ok(OutboundBody::Empty),
            Some(first) => {
                let first = first.map_err(|e| ApiGatewayError::Internal {
                    message: format!("failed to read request body: {}", e),
                })?;
                let prefix = futures::stream::iter(vec![Ok(first)]);
                let counted = CountedRequestStream {
                    inner: prefix.chain(stream).boxed(),
                    counter,
                };
                Ok(OutboundBody::Streamed(Some(reqwest::Body::wrap_stream(
                    counted,
                ))))
            }
        };
    }

    let mut buffered: Vec<Bytes> = Vec::new();
    let mut total = 0usize;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ApiGatewayError::Internal {
            message: format!("failed to read request body: {}", e),
        })?;
        total += chunk.len();
        buffered.push(chunk);
        if total > cap {
            // Too large to replay: chain what we have with the rest and
            // stream it.
            let prefix = futures::stream::iter(buffered.into_iter().map(Ok));
            let counted = CountedRequestStream {
                inner: prefix.chain(stream).boxed(),
                counter,
            };
            return Ok(OutboundBody::Streamed(Some(reqwest::Body::wrap_stream(
                counted,
            ))));
        }
    }

    if total == 0 {
        return Ok(OutboundBody::Empty);
    }
    counter.inc_by(total as u64);
    let mut joined = Vec::with_capacity(total);
    for chunk in &buffered {
        joined.extend_from_slice(chunk);
    }
    Ok(OutboundBody::Buffered(Bytes::from(joined)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop_header("Connection"));
        assert!(is_hop_by_hop_header("transfer-encoding"));
        assert!(is_hop_by_hop_header("Proxy-Authorization"));
        assert!(is_hop_by_hop_header("Upgrade"));
        assert!(!is_hop_by_hop_header("Content-Type"));
        assert!(!is_hop_by_hop_header("Authorization"));
        assert!(!is_hop_by_hop_header("Accept-Encoding"));
    }

    #[test]
    fn test_idempotent_methods() {
        assert!(is_idempotent(&Method::GET));
        assert!(is_idempotent(&Method::HEAD));
        assert!(is_idempotent(&Method::PUT));
        assert!(is_idempotent(&Method::DELETE));
        assert!(is_idempotent(&Method::OPTIONS));
        assert!(!is_idempotent(&Method::POST));
        assert!(!is_idempotent(&Method::PATCH));
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(502));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(504));
        assert!(!is_retryable_status(500));
        assert!(!is_retryable_status(429));
        assert!(!is_retryable_status(200));
    }

    #[test]
    fn test_rewrite_path_strips_matched_prefix() {
        assert_eq!(rewrite_path("/analytics/events", "/analytics", true), "/events");
        assert_eq!(rewrite_path("/analytics", "/analytics", true), "/");
        assert_eq!(rewrite_path("/analytics/", "/analytics", true), "/");
        assert_eq!(
            rewrite_path("/analytics/events", "/analytics", false),
            "/analytics/events"
        );
        // Root prefix never strips.
        assert_eq!(rewrite_path("/anything", "/", true), "/anything");
    }

    #[test]
    fn test_backoff_delay_growth_and_jitter_bounds() {
        let policy = RetryPolicy {
            attempts: 4,
            base_ms: 100,
        };
        let cap = Duration::from_secs(30);
        for (retry, base) in [(1u32, 100u64), (2, 200), (3, 400)] {
            for _ in 0..20 {
                let delay = backoff_delay(&policy, retry, cap).as_millis() as u64;
                assert!(
                    delay >= base * 3 / 4 && delay <= base * 5 / 4,
                    "retry {} delay {}ms outside jitter bounds of {}ms",
                    retry,
                    delay,
                    base
                );
            }
        }
    }

    #[test]
    fn test_backoff_delay_is_capped() {
        let policy = RetryPolicy {
            attempts: 10,
            base_ms: 10_000,
        };
        let cap = Duration::from_millis(1_000);
        assert_eq!(backoff_delay(&policy, 5, cap), cap);
    }

    #[tokio::test]
    async fn test_prepare_body_buffers_small_bodies() {
        let metrics = Metrics::new();
        let counter = metrics.bytes_in_total.with_label_values(&["t", "s"]);
        let body = Body::from("hello world");

        let prepared = prepare_body(body, true, 1024, counter.clone()).await.unwrap();
        match prepared {
            OutboundBody::Buffered(bytes) => assert_eq!(&bytes[..], b"hello world"),
            _ => panic!("small body should be buffered"),
        }
        assert_eq!(counter.get(), 11);
    }

    #[tokio::test]
    async fn test_prepare_body_empty() {
        let metrics = Metrics::new();
        let counter = metrics.bytes_in_total.with_label_values(&["t", "s"]);
        let prepared = prepare_body(Body::empty(), true, 1024, counter).await.unwrap();
        assert!(matches!(prepared, OutboundBody::Empty));
    }

    #[tokio::test]
    async fn test_prepare_body_overflow_falls_back_to_streaming() {
        let metrics = Metrics::new();
        let counter = metrics.bytes_in_total.with_label_values(&["t", "s"]);
        let body = Body::from(vec![0u8; 64]);

        let prepared = prepare_body(body, true, 16, counter).await.unwrap();
        assert!(matches!(prepared, OutboundBody::Streamed(Some(_))));
        assert!(!prepared.replayable());
    }

    #[tokio::test]
    async fn test_prepare_body_streams_when_not_retry_eligible() {
        let metrics = Metrics::new();
        let counter = metrics.bytes_in_total.with_label_values(&["t", "s"]);
        let prepared = prepare_body(Body::from("payload"), false, 1024, counter)
            .await
            .unwrap();
        assert!(!prepared.replayable());
    }
}
