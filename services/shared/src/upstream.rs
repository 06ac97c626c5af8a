use serde::{Deserialize, Serialize};

use crate::error::{Result, ServiceError};
use crate::types::ServiceId;

fn default_health_path() -> String {
    "/health".to_string()
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Retry policy applied by the proxy to idempotent upstream calls.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub attempts: u32,
    /// Initial backoff interval in milliseconds; doubles per attempt.
    pub base_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 1,
            base_ms: 100,
        }
    }
}

/// Registration record for one upstream microservice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamService {
    pub id: ServiceId,
    pub base_url: String,
    /// Gateway-side path prefix that routes to this service.
    pub path_prefix: String,
    /// Host scope for the prefix; `None` means the global (wildcard) scope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    /// When absent, every method is allowed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_methods: Option<Vec<String>>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub strip_prefix: bool,
    /// Per-service policy to drop the inbound Authorization header.
    #[serde(default)]
    pub strip_authorization: bool,
    #[serde(default)]
    pub required_scopes: Vec<String>,
    #[serde(default = "default_health_path")]
    pub health_path: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl UpstreamService {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.timeout_ms)
    }

    pub fn health_url(&self) -> String {
        format!(
            "{}{}",
            self.base_url.trim_end_matches('/'),
            self.health_path
        )
    }

    pub fn allows_method(&self, method: &str) -> bool {
        match &self.allowed_methods {
            Some(methods) => methods.iter().any(|m| m.eq_ignore_ascii_case(method)),
            None => true,
        }
    }

    /// Structural validation independent of the rest of the registry.
    /// URL parseability is checked by the registry, which owns an HTTP
    /// client and its URL type.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(ServiceError::Validation(
                "service id must not be empty".to_string(),
            ));
        }
        if !self.path_prefix.starts_with('/') {
            return Err(ServiceError::Validation(format!(
                "service '{}': path_prefix '{}' must start with '/'",
                self.id, self.path_prefix
            )));
        }
        if !self.health_path.starts_with('/') {
            return Err(ServiceError::Validation(format!(
                "service '{}': health_path '{}' must start with '/'",
                self.id, self.health_path
            )));
        }
        if self.timeout_ms == 0 {
            return Err(ServiceError::Validation(format!(
                "service '{}': timeout_ms must be positive",
                self.id
            )));
        }
        if self.retry.attempts == 0 {
            return Err(ServiceError::Validation(format!(
                "service '{}': retry attempts must be at least 1",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service(id: &str, prefix: &str) -> UpstreamService {
        UpstreamService {
            id: id.to_string(),
            base_url: "http://localhost:8010".to_string(),
            path_prefix: prefix.to_string(),
            host: None,
            allowed_methods: None,
            timeout_ms: 1_000,
            retry: RetryPolicy::default(),
            strip_prefix: true,
            strip_authorization: false,
            required_scopes: Vec::new(),
            health_path: "/health".to_string(),
            tags: Vec::new(),
        }
    }

    #[test]
    fn test_method_allow_list() {
        let mut svc = service("analytics", "/analytics");
        assert!(svc.allows_method("POST"));

        svc.allowed_methods = Some(vec!["GET".to_string(), "HEAD".to_string()]);
        assert!(svc.allows_method("get"));
        assert!(!svc.allows_method("POST"));
    }

    #[test]
    fn test_health_url_joins_cleanly() {
        let mut svc = service("analytics", "/analytics");
        svc.base_url = "http://a:8010/".to_string();
        assert_eq!(svc.health_url(), "http://a:8010/health");
    }

    #[test]
    fn test_validation_rejects_bad_records() {
        assert!(service("analytics", "/analytics").validate().is_ok());
        assert!(service("", "/x").validate().is_err());
        assert!(service("x", "no-slash").validate().is_err());

        let mut svc = service("x", "/x");
        svc.retry.attempts = 0;
        assert!(svc.validate().is_err());
    }
}
