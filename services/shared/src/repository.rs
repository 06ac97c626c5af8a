//! Persistence abstractions for the tenant catalog and the service
//! registry source.
//!
//! Backends are pluggable: a JSON file store, a Postgres store, and an
//! in-memory store used by tests. The gateway only ever talks to the
//! traits.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::tenant::Tenant;
use crate::types::TenantId;
use crate::upstream::UpstreamService;

pub mod file;
pub mod memory;
pub mod postgres;

pub use file::{FileServiceRepository, FileTenantRepository};
pub use memory::{InMemoryServiceRepository, InMemoryTenantRepository};
pub use postgres::{PostgresServiceRepository, PostgresTenantRepository};

#[async_trait]
pub trait TenantRepository: Send + Sync {
    async fn list(&self) -> Result<Vec<Tenant>>;
    async fn get(&self, id: &TenantId) -> Result<Option<Tenant>>;
    /// Insert or replace the record. The caller is responsible for bumping
    /// `updated_at`; the store is last-writer-wins.
    async fn upsert(&self, tenant: &Tenant) -> Result<Tenant>;
    /// Marks the tenant `Deleted`. The id stays reserved forever.
    async fn delete(&self, id: &TenantId) -> Result<()>;
}

#[async_trait]
pub trait ServiceRepository: Send + Sync {
    /// Ordered list of registered upstreams, re-read from the source so a
    /// registry reload observes edits.
    async fn list(&self) -> Result<Vec<UpstreamService>>;
}

/// Opens the tenant store named by a config source. `postgres://` URIs get
/// the SQL backend, anything else is treated as a JSON file path.
pub async fn open_tenant_repository(source: &str) -> Result<Arc<dyn TenantRepository>> {
    if source.starts_with("postgres://") || source.starts_with("postgresql://") {
        let repo = PostgresTenantRepository::connect(source).await?;
        Ok(Arc::new(repo))
    } else {
        let repo = FileTenantRepository::open(source).await?;
        Ok(Arc::new(repo))
    }
}

/// Opens the service registry source, by the same scheme rules as
/// [`open_tenant_repository`].
pub async fn open_service_repository(source: &str) -> Result<Arc<dyn ServiceRepository>> {
    if source.starts_with("postgres://") || source.starts_with("postgresql://") {
        let repo = PostgresServiceRepository::connect(source).await?;
        Ok(Arc::new(repo))
    } else {
        Ok(Arc::new(FileServiceRepository::new(source)))
    }
}
