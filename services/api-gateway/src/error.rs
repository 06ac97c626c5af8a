use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ApiGatewayError {
    #[error("Invalid configuration: {message}")]
    ConfigInvalid { message: String },

    #[error("Invalid authentication token: {message}")]
    AuthInvalid { message: String },

    #[error("Forbidden: {message}")]
    AuthForbidden { message: String },

    #[error("Tenant is suspended: {tenant_id}")]
    TenantSuspended { tenant_id: String },

    #[error("Unknown tenant: {message}")]
    TenantUnknown { message: String },

    #[error("No route for path: {path}")]
    RouteNotFound { path: String },

    #[error("Method not allowed")]
    MethodNotAllowed { allow: Vec<String> },

    #[error("Rate limit exceeded: {reason}")]
    RateLimited { reason: String, retry_after: u64 },

    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Upstream unavailable: {service}")]
    UpstreamUnavailable { service: String, message: String },

    #[error("Upstream busy: {service}")]
    UpstreamBusy { service: String, retry_after: u64 },

    #[error("Upstream timed out: {service}")]
    UpstreamTimeout { service: String },

    #[error("Internal gateway error: {message}")]
    Internal { message: String },
}

pub type ApiResult<T> = Result<T, ApiGatewayError>;

/// Wire shape of every gateway-originated error response.
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorBody {
    pub error: ErrorDetails,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    pub code: String,
    pub message: String,
    pub trace_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ApiGatewayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiGatewayError::ConfigInvalid { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            ApiGatewayError::AuthInvalid { .. } => StatusCode::UNAUTHORIZED,
            ApiGatewayError::AuthForbidden { .. } => StatusCode::FORBIDDEN,
            ApiGatewayError::TenantSuspended { .. } => StatusCode::FORBIDDEN,
            ApiGatewayError::TenantUnknown { .. } => StatusCode::NOT_FOUND,
            ApiGatewayError::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            ApiGatewayError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            ApiGatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ApiGatewayError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            ApiGatewayError::UpstreamUnavailable { .. } => StatusCode::BAD_GATEWAY,
            ApiGatewayError::UpstreamBusy { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiGatewayError::UpstreamTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            ApiGatewayError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            ApiGatewayError::ConfigInvalid { .. } => "CONFIG_INVALID",
            ApiGatewayError::AuthInvalid { .. } => "AUTH_INVALID",
            ApiGatewayError::AuthForbidden { .. } => "AUTH_FORBIDDEN",
            ApiGatewayError::TenantSuspended { .. } => "TENANT_SUSPENDED",
            ApiGatewayError::TenantUnknown { .. } => "TENANT_UNKNOWN",
            ApiGatewayError::RouteNotFound { .. } => "ROUTE_NOT_FOUND",
            ApiGatewayError::MethodNotAllowed { .. } => "METHOD_NOT_ALLOWED",
            ApiGatewayError::RateLimited { .. } => "RATE_LIMITED",
            ApiGatewayError::InvalidRequest { .. } => "INVALID_REQUEST",
            ApiGatewayError::UpstreamUnavailable { .. } => "UPSTREAM_UNAVAILABLE",
            ApiGatewayError::UpstreamBusy { .. } => "UPSTREAM_BUSY",
            ApiGatewayError::UpstreamTimeout { .. } => "UPSTREAM_TIMEOUT",
            ApiGatewayError::Internal { .. } => "GATEWAY_INTERNAL",
        }
    }

    pub fn retry_after(&self) -> Option<u64> {
        match self {
            ApiGatewayError::RateLimited { retry_after, .. } => Some(*retry_after),
            ApiGatewayError::UpstreamBusy { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }

    /// Outcome label used for metrics.
    pub fn outcome(&self) -> &'static str {
        match self {
            ApiGatewayError::RateLimited { .. } => "rate_limited",
            ApiGatewayError::UpstreamTimeout { .. } => "timeout",
            ApiGatewayError::UpstreamUnavailable { .. } | ApiGatewayError::UpstreamBusy { .. } => {
                "upstream_error"
            }
            _ => "rejected",
        }
    }

    /// Renders the JSON error shape with the request's trace id. Messages
    /// never include upstream addresses or internals beyond the display
    /// string of the variant.
    pub fn into_response_with_trace(self, trace_id: &str) -> Response {
        let status = self.status_code();
        let retry_after = self.retry_after();
        let body = ApiErrorBody {
            error: ErrorDetails {
                code: self.error_code().to_string(),
                message: self.to_string(),
                trace_id: trace_id.to_string(),
                retry_after,
            },
        };

        let mut response = Json(body).into_response();
        *response.status_mut() = status;

        if let Some(secs) = retry_after {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        if let ApiGatewayError::MethodNotAllowed { allow } = &self {
            if let Ok(value) = HeaderValue::from_str(&allow.join(", ")) {
                response.headers_mut().insert(header::ALLOW, value);
            }
        }

        response
    }
}

impl IntoResponse for ApiGatewayError {
    fn into_response(self) -> Response {
        // Handlers that carry a request trace id should prefer
        // into_response_with_trace; this path mints one so the body shape
        // stays uniform.
        let trace_id = Uuid::new_v4().to_string();
        self.into_response_with_trace(&trace_id)
    }
}

impl From<nimbus_shared::ServiceError> for ApiGatewayError {
    fn from(error: nimbus_shared::ServiceError) -> Self {
        use nimbus_shared::ServiceError;
        match error {
            ServiceError::Validation(message) => ApiGatewayError::InvalidRequest { message },
            ServiceError::Configuration(message) => ApiGatewayError::ConfigInvalid { message },
            ServiceError::NotFound(message) => ApiGatewayError::TenantUnknown { message },
            other => ApiGatewayError::Internal {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes_follow_taxonomy() {
        assert_eq!(
            ApiGatewayError::AuthInvalid {
                message: "expired".to_string()
            }
            .status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiGatewayError::TenantSuspended {
                tenant_id: "acme".to_string()
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            ApiGatewayError::RouteNotFound {
                path: "/nope".to_string()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiGatewayError::RateLimited {
                reason: "minute".to_string(),
                retry_after: 30
            }
            .status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ApiGatewayError::UpstreamTimeout {
                service: "billing".to_string()
            }
            .status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
    }

    #[test]
    fn test_retry_after_header_on_429() {
        let err = ApiGatewayError::RateLimited {
            reason: "minute window".to_string(),
            retry_after: 42,
        };
        let response = err.into_response_with_trace("trace-1");
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("42")
        );
    }

    #[test]
    fn test_allow_header_on_405() {
        let err = ApiGatewayError::MethodNotAllowed {
            allow: vec!["GET".to_string(), "HEAD".to_string()],
        };
        let response = err.into_response_with_trace("trace-1");
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(
            response.headers().get(header::ALLOW).unwrap(),
            &HeaderValue::from_static("GET, HEAD")
        );
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(
            ApiGatewayError::RateLimited {
                reason: "x".to_string(),
                retry_after: 1
            }
            .outcome(),
            "rate_limited"
        );
        assert_eq!(
            ApiGatewayError::UpstreamTimeout {
                service: "billing".to_string()
            }
            .outcome(),
            "timeout"
        );
        assert_eq!(
            ApiGatewayError::RouteNotFound {
                path: "/x".to_string()
            }
            .outcome(),
            "rejected"
        );
    }
}
