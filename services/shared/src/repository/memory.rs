//! In-memory backends, used by unit and integration tests.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::{Result, ServiceError};
use crate::repository::{ServiceRepository, TenantRepository};
use crate::tenant::{Tenant, TenantStatus};
use crate::types::TenantId;
use crate::upstream::UpstreamService;

#[derive(Default)]
pub struct InMemoryTenantRepository {
    tenants: RwLock<HashMap<TenantId, Tenant>>,
}

impl InMemoryTenantRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tenants(tenants: Vec<Tenant>) -> Self {
        let map = tenants.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self {
            tenants: RwLock::new(map),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TenantId, Tenant>> {
        self.tenants.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TenantId, Tenant>> {
        self.tenants.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl TenantRepository for InMemoryTenantRepository {
    async fn list(&self) -> Result<Vec<Tenant>> {
        let mut tenants: Vec<Tenant> = self.read().values().cloned().collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tenants)
    }

    async fn get(&self, id: &TenantId) -> Result<Option<Tenant>> {
        Ok(self.read().get(id).cloned())
    }

    async fn upsert(&self, tenant: &Tenant) -> Result<Tenant> {
        self.write().insert(tenant.id.clone(), tenant.clone());
        Ok(tenant.clone())
    }

    async fn delete(&self, id: &TenantId) -> Result<()> {
        let mut tenants = self.write();
        match tenants.get_mut(id) {
            Some(tenant) => {
                tenant.status = TenantStatus::Deleted;
                tenant.updated_at = chrono::Utc::now();
                Ok(())
            }
            None => Err(ServiceError::NotFound(format!("tenant '{}'", id))),
        }
    }
}

pub struct InMemoryServiceRepository {
    services: RwLock<Vec<UpstreamService>>,
}

impl InMemoryServiceRepository {
    pub fn new(services: Vec<UpstreamService>) -> Self {
        Self {
            services: RwLock::new(services),
        }
    }

    pub fn replace(&self, services: Vec<UpstreamService>) {
        *self.services.write().unwrap_or_else(|e| e.into_inner()) = services;
    }
}

#[async_trait]
impl ServiceRepository for InMemoryServiceRepository {
    async fn list(&self) -> Result<Vec<UpstreamService>> {
        Ok(self
            .services
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone())
    }
}
