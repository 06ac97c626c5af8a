use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::task::JoinHandle;
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{info, warn};

use nimbus_shared::repository::{
    open_service_repository, open_tenant_repository, ServiceRepository, TenantRepository,
};

use crate::admin;
use crate::auth::build_verifier;
use crate::config::{ApiGatewayConfig, RateLimitBackend};
use crate::error::{ApiGatewayError, ApiResult};
use crate::handlers::{gateway_health, gateway_metrics, proxy_handler, AppState};
use crate::health::{spawn_probe_loop, HealthAggregator};
use crate::metrics::{Metrics, StatsCollector};
use crate::middleware::{logging_middleware, request_id_middleware};
use crate::proxy::UpstreamProxy;
use crate::rate_limiter::{
    spawn_sweeper, ConcurrencyLimiter, MemoryCounterStore, RateLimiter, RedisCounterStore,
};
use crate::registry::ServiceRegistry;
use crate::resolver::{TenantCatalog, TenantResolver};

/// Builds the full gateway: repositories, catalog, registry, verifier,
/// limiter (plus sweeper), health loop, and the axum router. Tests pass
/// their own repositories; production resolves them from the config
/// sources.
pub async fn build_gateway(
    config: ApiGatewayConfig,
    tenant_repo: Option<Arc<dyn TenantRepository>>,
    service_repo: Option<Arc<dyn ServiceRepository>>,
) -> ApiResult<(Router, AppState)> {
    let config = Arc::new(config);

    let tenant_repo = match tenant_repo {
        Some(repo) => repo,
        None => open_tenant_repository(&config.sources.tenants_path).await?,
    };
    let service_repo = match service_repo {
        Some(repo) => repo,
        None => open_service_repository(&config.sources.services_path).await?,
    };

    let catalog = Arc::new(TenantCatalog::load(tenant_repo).await?);
    let registry = Arc::new(ServiceRegistry::load(service_repo).await?);
    let resolver = Arc::new(TenantResolver::new(
        catalog.clone(),
        config.tenancy.base_domain.clone(),
        config.tenancy.default_tenant_id.clone(),
    ));
    let verifier = build_verifier(&config.auth)?;
    let metrics = Arc::new(Metrics::new());
    let stats = Arc::new(StatsCollector::new());

    let limiter = match config.rate_limiting.backend {
        RateLimitBackend::Memory => {
            let store = Arc::new(MemoryCounterStore::new());
            let _sweeper = spawn_sweeper(
                store.clone(),
                Duration::from_secs(config.rate_limiting.sweep_interval_seconds.max(1)),
            );
            Arc::new(RateLimiter::new(store, config.rate_limiting.fail_mode))
        }
        RateLimitBackend::Redis => {
            let url = config.rate_limiting.redis_url.as_deref().ok_or_else(|| {
                ApiGatewayError::ConfigInvalid {
                    message: "RATE_LIMIT_BACKEND=redis requires REDIS_URL".to_string(),
                }
            })?;
            let store = RedisCounterStore::new(url).map_err(|e| ApiGatewayError::ConfigInvalid {
                message: e.to_string(),
            })?;
            Arc::new(RateLimiter::new(
                Arc::new(store),
                config.rate_limiting.fail_mode,
            ))
        }
    };

    let proxy = Arc::new(UpstreamProxy::new(
        config.upstream.clone(),
        config.server.debug_headers,
        metrics.clone(),
    )?);
    let health = Arc::new(HealthAggregator::new(
        registry.clone(),
        metrics.clone(),
        config.health.degraded_latency_ms,
    ));
    let _probe_loop = spawn_probe_loop(health.clone(), config.probe_interval());
    let _catalog_refresh = spawn_catalog_refresh(
        catalog.clone(),
        Duration::from_secs(config.tenancy.catalog_refresh_seconds.max(1)),
    );

    let state = AppState {
        config: config.clone(),
        registry,
        catalog,
        resolver,
        verifier,
        limiter,
        concurrency: Arc::new(ConcurrencyLimiter::new()),
        proxy,
        health,
        metrics,
        stats,
        started_at: Instant::now(),
    };

    let app = build_router(
        state.clone(),
        config.request_timeout(),
        config.server.max_concurrent_requests,
    );
    Ok((app, state))
}

fn build_router(state: AppState, request_timeout: Duration, max_in_flight: usize) -> Router {
    Router::new()
        // Reserved gateway surface.
        .route("/_gateway/health", get(gateway_health))
        .route("/_gateway/metrics", get(gateway_metrics))
        .route("/_gateway/stats", get(admin::stats_overview))
        .route(
            "/_gateway/tenants",
            get(admin::list_tenants).post(admin::create_tenant),
        )
        .route(
            "/_gateway/tenants/:id",
            get(admin::get_tenant)
                .patch(admin::update_tenant)
                .delete(admin::delete_tenant),
        )
        .route("/_gateway/services", get(admin::list_services))
        .route("/_gateway/services/reload", post(admin::reload_services))
        .route("/_gateway/services/:id", get(admin::get_service))
        .route(
            "/_gateway/health/history/:id",
            get(admin::service_health_history),
        )
        .route("/_gateway/health/:id", get(admin::service_health))
        .route(
            "/_gateway/health/:id/check",
            post(admin::check_service_health),
        )
        // Everything else is proxied.
        .fallback(proxy_handler)
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(GlobalConcurrencyLimitLayer::new(max_in_flight))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(logging_middleware))
        .layer(middleware::from_fn(request_id_middleware))
}

fn spawn_catalog_refresh(catalog: Arc<TenantCatalog>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; the catalog was just loaded.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = catalog.refresh().await {
                warn!(error = %e, "Tenant catalog refresh failed");
            }
        }
    })
}

pub struct ApiGatewayServer {
    config: Arc<ApiGatewayConfig>,
    app: Router,
}

impl ApiGatewayServer {
    pub async fn new(config: ApiGatewayConfig) -> ApiResult<Self> {
        info!("Initializing API gateway");
        let config_arc = Arc::new(config.clone());
        let (app, _state) = build_gateway(config, None, None).await?;
        info!("API gateway initialized");
        Ok(Self {
            config: config_arc,
            app,
        })
    }

    pub async fn run(self) -> ApiResult<()> {
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            ApiGatewayError::ConfigInvalid {
                message: format!("failed to bind {}: {}", addr, e),
            }
        })?;

        info!(addr = %addr, "API gateway listening");

        axum::serve(
            listener,
            self.app
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ApiGatewayError::Internal {
            message: format!("server error: {}", e),
        })
    }
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Shutdown signal received; draining");
    }
}
