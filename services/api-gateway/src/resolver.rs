//! Tenant resolution.
//!
//! Maps each inbound request to exactly one tenant, deterministically,
//! through four ordered strategies: explicit header, host, verified token
//! claim, configured default. Resolution reads a catalog snapshot that is
//! refreshed out-of-band, so the hot path does no I/O.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use nimbus_shared::auth::Claims;
use nimbus_shared::repository::TenantRepository;
use nimbus_shared::tenant::{validate_custom_domains, Tenant, TenantStatus};
use nimbus_shared::types::TenantId;

use crate::error::{ApiGatewayError, ApiResult};

struct CatalogSnapshot {
    tenants: HashMap<TenantId, Tenant>,
    /// Lowercased custom domain -> tenant id. Globally unique by
    /// validation.
    domains: HashMap<String, TenantId>,
}

impl CatalogSnapshot {
    fn build(tenants: Vec<Tenant>) -> ApiResult<Self> {
        validate_custom_domains(&tenants).map_err(|e| ApiGatewayError::ConfigInvalid {
            message: e.to_string(),
        })?;

        let mut domains = HashMap::new();
        for tenant in &tenants {
            for domain in &tenant.custom_domains {
                domains.insert(domain.to_ascii_lowercase(), tenant.id.clone());
            }
        }
        let tenants = tenants.into_iter().map(|t| (t.id.clone(), t)).collect();
        Ok(Self { tenants, domains })
    }
}

/// Read-through view of the tenant store.
pub struct TenantCatalog {
    repo: Arc<dyn TenantRepository>,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
}

impl TenantCatalog {
    pub async fn load(repo: Arc<dyn TenantRepository>) -> ApiResult<Self> {
        let tenants = repo.list().await?;
        let snapshot = CatalogSnapshot::build(tenants)?;
        Ok(Self {
            repo,
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// Rebuilds the snapshot from the store. On a validation failure the
    /// previous snapshot stays in effect.
    pub async fn refresh(&self) -> ApiResult<()> {
        let tenants = self.repo.list().await?;
        match CatalogSnapshot::build(tenants) {
            Ok(snapshot) => {
                *self.snapshot.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(snapshot);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Tenant catalog refresh rejected; keeping previous snapshot");
                Err(e)
            }
        }
    }

    pub fn repository(&self) -> Arc<dyn TenantRepository> {
        self.repo.clone()
    }

    fn snapshot(&self) -> Arc<CatalogSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Tenant> {
        self.snapshot().tenants.get(id).cloned()
    }

    pub fn by_custom_domain(&self, host: &str) -> Option<Tenant> {
        let snapshot = self.snapshot();
        let id = snapshot.domains.get(&host.to_ascii_lowercase())?;
        snapshot.tenants.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot().tenants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Which strategy produced the tenant; logged with each resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    Header,
    Host,
    Claim,
    Default,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::Header => "header",
            ResolutionStrategy::Host => "host",
            ResolutionStrategy::Claim => "claim",
            ResolutionStrategy::Default => "default",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub tenant: Tenant,
    pub strategy: ResolutionStrategy,
}

pub struct TenantResolver {
    catalog: Arc<TenantCatalog>,
    base_domain: Option<String>,
    default_tenant_id: TenantId,
}

impl TenantResolver {
    pub fn new(
        catalog: Arc<TenantCatalog>,
        base_domain: Option<String>,
        default_tenant_id: TenantId,
    ) -> Self {
        Self {
            catalog,
            base_domain: base_domain.map(|d| d.to_ascii_lowercase()),
            default_tenant_id,
        }
    }

    /// Resolves the tenant for one request. A strategy that names an
    /// existing tenant terminates resolution; the status gate then decides
    /// whether the request proceeds. Strategies that name nothing known
    /// fall through to the next one.
    pub fn resolve(
        &self,
        header_tenant: Option<&str>,
        host: &str,
        claims: Option<&Claims>,
    ) -> ApiResult<Resolution> {
        let host = normalize_host(host);

        // Strategy 1: explicit header.
        if let Some(id) = header_tenant {
            if let Some(tenant) = self.catalog.get(id) {
                return gate(tenant, ResolutionStrategy::Header);
            }
        }

        // Strategy 2: host label under the base domain, then custom domain.
        if let Some(base) = &self.base_domain {
            if let Some(label) = host
                .strip_suffix(base.as_str())
                .and_then(|p| p.strip_suffix('.'))
            {
                if !label.contains('.') {
                    if let Some(tenant) = self.catalog.get(label) {
                        return gate(tenant, ResolutionStrategy::Host);
                    }
                }
            }
        }
        if let Some(tenant) = self.catalog.by_custom_domain(&host) {
            return gate(tenant, ResolutionStrategy::Host);
        }

        // Strategy 3: verified token claim.
        if let Some(id) = claims.and_then(|c| c.tenant_claim()) {
            if let Some(tenant) = self.catalog.get(id) {
                return gate(tenant, ResolutionStrategy::Claim);
            }
        }

        // Strategy 4: configured default.
        if let Some(tenant) = self.catalog.get(&self.default_tenant_id) {
            return gate(tenant, ResolutionStrategy::Default);
        }

        debug!(host = %host, "No tenant resolution strategy matched");
        Err(ApiGatewayError::TenantUnknown {
            message: "no strategy produced a known tenant".to_string(),
        })
    }
}

fn gate(tenant: Tenant, strategy: ResolutionStrategy) -> ApiResult<Resolution> {
    match tenant.status {
        TenantStatus::Active => {
            debug!(tenant_id = %tenant.id, strategy = strategy.as_str(), "Tenant resolved");
            Ok(Resolution { tenant, strategy })
        }
        TenantStatus::Suspended => Err(ApiGatewayError::TenantSuspended {
            tenant_id: tenant.id,
        }),
        TenantStatus::Deleted => Err(ApiGatewayError::TenantUnknown {
            message: format!("tenant '{}' no longer exists", tenant.id),
        }),
    }
}

fn normalize_host(host: &str) -> String {
    let host = host.split(':').next().unwrap_or(host);
    host.trim_end_matches('.').to_ascii_lowercase()
}
