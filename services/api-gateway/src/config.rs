use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use nimbus_shared::config::LoggingConfig;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ApiGatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub tenancy: TenancyConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Outer bound on a whole request; per-upstream deadlines are tighter.
    pub request_timeout_seconds: u64,
    /// Global cap on requests in flight, across all tenants and upstreams.
    pub max_concurrent_requests: usize,
    /// Emit X-Gateway-Upstream on proxied responses.
    pub debug_headers: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            request_timeout_seconds: 120,
            max_concurrent_requests: 8_192,
            debug_headers: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthBackend {
    Secret,
    Jwks,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub backend: AuthBackend,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwks_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audience: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issuer: Option<String>,
    /// Verifier key cache TTL; the verifier contract caps this at 10 min.
    pub key_cache_ttl_seconds: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            backend: AuthBackend::Secret,
            jwt_secret: None,
            jwks_url: None,
            audience: None,
            issuer: None,
            key_cache_ttl_seconds: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailMode {
    Open,
    Closed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    pub backend: RateLimitBackend,
    pub fail_mode: FailMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis_url: Option<String>,
    pub sweep_interval_seconds: u64,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            backend: RateLimitBackend::Memory,
            fail_mode: FailMode::Open,
            redis_url: None,
            sweep_interval_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub probe_interval_ms: u64,
    pub degraded_latency_ms: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe_interval_ms: 30_000,
            degraded_latency_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub default_timeout_ms: u64,
    /// Idle connections kept per upstream host.
    pub max_idle_conns: usize,
    /// In-flight cap per upstream; beyond it requests get 503 after a
    /// short wait.
    pub max_in_flight: usize,
    /// How long to wait for an in-flight slot before 503.
    pub acquire_timeout_ms: u64,
    /// Idempotent request bodies up to this size are buffered so retries
    /// can replay them; larger bodies stream and are never retried.
    pub retry_body_cap_bytes: usize,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_idle_conns: 100,
            max_in_flight: 200,
            acquire_timeout_ms: 200,
            retry_body_cap_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenancyConfig {
    /// Host suffix for subdomain-based tenant resolution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_domain: Option<String>,
    pub default_tenant_id: String,
    /// How often the resolver's catalog snapshot is refreshed from the
    /// tenant store.
    pub catalog_refresh_seconds: u64,
}

impl Default for TenancyConfig {
    fn default() -> Self {
        Self {
            base_domain: None,
            default_tenant_id: "default".to_string(),
            catalog_refresh_seconds: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourcesConfig {
    /// Path or postgres:// URI of the service registry source.
    pub services_path: String,
    /// Path or postgres:// URI of the tenant catalog source.
    pub tenants_path: String,
}

impl Default for SourcesConfig {
    fn default() -> Self {
        Self {
            services_path: "config/services.json".to_string(),
            tenants_path: "config/tenants.json".to_string(),
        }
    }
}

impl ApiGatewayConfig {
    /// Builds configuration from an optional file plus `GATEWAY__`-prefixed
    /// environment, then applies the flat, documented environment keys
    /// (BASE_DOMAIN, JWT_SECRET, ...) on top.
    pub fn from_env() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var("GATEWAY_CONFIG_PATH") {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let raw = builder
            .add_source(config::Environment::with_prefix("GATEWAY").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let mut cfg: ApiGatewayConfig = raw
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    /// The flat keys documented in the deployment guide win over both the
    /// config file and the prefixed environment.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BASE_DOMAIN") {
            self.tenancy.base_domain = Some(v);
        }
        if let Ok(v) = std::env::var("DEFAULT_TENANT_ID") {
            self.tenancy.default_tenant_id = v;
        }
        if let Ok(v) = std::env::var("AUTH_BACKEND") {
            match v.to_ascii_lowercase().as_str() {
                "jwks" => self.auth.backend = AuthBackend::Jwks,
                _ => self.auth.backend = AuthBackend::Secret,
            }
        }
        if let Ok(v) = std::env::var("JWT_SECRET") {
            self.auth.jwt_secret = Some(v);
        }
        if let Ok(v) = std::env::var("JWKS_URL") {
            self.auth.jwks_url = Some(v);
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_FAIL_MODE") {
            self.rate_limiting.fail_mode = match v.to_ascii_lowercase().as_str() {
                "closed" => FailMode::Closed,
                _ => FailMode::Open,
            };
        }
        if let Ok(v) = std::env::var("RATE_LIMIT_BACKEND") {
            self.rate_limiting.backend = match v.to_ascii_lowercase().as_str() {
                "redis" => RateLimitBackend::Redis,
                _ => RateLimitBackend::Memory,
            };
        }
        if let Ok(v) = std::env::var("REDIS_URL") {
            self.rate_limiting.redis_url = Some(v);
        }
        if let Ok(Ok(v)) = std::env::var("HEALTH_PROBE_INTERVAL_MS").map(|v| v.parse()) {
            self.health.probe_interval_ms = v;
        }
        if let Ok(Ok(v)) = std::env::var("HEALTH_DEGRADED_LATENCY_MS").map(|v| v.parse()) {
            self.health.degraded_latency_ms = v;
        }
        if let Ok(Ok(v)) = std::env::var("UPSTREAM_DEFAULT_TIMEOUT_MS").map(|v| v.parse()) {
            self.upstream.default_timeout_ms = v;
        }
        if let Ok(Ok(v)) = std::env::var("UPSTREAM_MAX_IDLE_CONNS").map(|v| v.parse()) {
            self.upstream.max_idle_conns = v;
        }
        if let Ok(v) = std::env::var("SERVICES_CONFIG_PATH") {
            self.sources.services_path = v;
        }
        if let Ok(v) = std::env::var("TENANTS_CONFIG_PATH") {
            self.sources.tenants_path = v;
        }
    }

    /// Startup configuration errors are fatal.
    pub fn validate(&self) -> Result<()> {
        match self.auth.backend {
            AuthBackend::Secret => {
                if self.auth.jwt_secret.as_deref().unwrap_or("").is_empty() {
                    bail!("AUTH_BACKEND=secret requires JWT_SECRET");
                }
            }
            AuthBackend::Jwks => {
                if self.auth.jwks_url.as_deref().unwrap_or("").is_empty() {
                    bail!("AUTH_BACKEND=jwks requires JWKS_URL");
                }
            }
        }
        if self.rate_limiting.backend == RateLimitBackend::Redis
            && self.rate_limiting.redis_url.as_deref().unwrap_or("").is_empty()
        {
            bail!("RATE_LIMIT_BACKEND=redis requires REDIS_URL");
        }
        if self.auth.key_cache_ttl_seconds > 600 {
            bail!("auth key cache TTL must not exceed 10 minutes");
        }
        if self.health.probe_interval_ms == 0 {
            bail!("health probe interval must be positive");
        }
        if nimbus_shared::tenant::validate_tenant_id(&self.tenancy.default_tenant_id).is_err() {
            bail!(
                "DEFAULT_TENANT_ID '{}' is not a valid tenant id",
                self.tenancy.default_tenant_id
            );
        }
        Ok(())
    }

    /// A local development configuration used by tests.
    pub fn development() -> Self {
        Self {
            auth: AuthConfig {
                jwt_secret: Some("development-secret-change-in-production".to_string()),
                ..AuthConfig::default()
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
                format: "pretty".to_string(),
                file_path: None,
            },
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_seconds)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.health.probe_interval_ms)
    }

    pub fn default_upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream.default_timeout_ms)
    }
}
