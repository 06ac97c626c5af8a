//! JSON file backends.
//!
//! The tenants store is a flat JSON object keyed by tenant id and is
//! rewritten atomically (tmp + rename) on every mutation. The services
//! store is an ordered JSON array, read on demand so registry reloads see
//! edits without a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{Result, ServiceError};
use crate::repository::{ServiceRepository, TenantRepository};
use crate::tenant::{Tenant, TenantStatus};
use crate::types::TenantId;
use crate::upstream::UpstreamService;

pub struct FileTenantRepository {
    path: PathBuf,
    tenants: RwLock<HashMap<TenantId, Tenant>>,
}

impl FileTenantRepository {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tenants = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let map: HashMap<TenantId, Tenant> = serde_json::from_slice(&bytes)?;
                for (key, tenant) in &map {
                    if key != &tenant.id {
                        return Err(ServiceError::Validation(format!(
                            "tenants file key '{}' does not match record id '{}'",
                            key, tenant.id
                        )));
                    }
                }
                map
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            tenants: RwLock::new(tenants),
        })
    }

    async fn persist(&self, tenants: &HashMap<TenantId, Tenant>) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(tenants)?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl TenantRepository for FileTenantRepository {
    async fn list(&self) -> Result<Vec<Tenant>> {
        let mut tenants: Vec<Tenant> = self.tenants.read().await.values().cloned().collect();
        tenants.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tenants)
    }

    async fn get(&self, id: &TenantId) -> Result<Option<Tenant>> {
        Ok(self.tenants.read().await.get(id).cloned())
    }

    async fn upsert(&self, tenant: &Tenant) -> Result<Tenant> {
        let mut tenants = self.tenants.write().await;
        tenants.insert(tenant.id.clone(), tenant.clone());
        self.persist(&tenants).await?;
        Ok(tenant.clone())
    }

    async fn delete(&self, id: &TenantId) -> Result<()> {
        let mut tenants = self.tenants.write().await;
        let tenant = tenants
            .get_mut(id)
            .ok_or_else(|| ServiceError::NotFound(format!("tenant '{}'", id)))?;
        tenant.status = TenantStatus::Deleted;
        tenant.updated_at = chrono::Utc::now();
        self.persist(&tenants).await?;
        Ok(())
    }
}

pub struct FileServiceRepository {
    path: PathBuf,
}

impl FileServiceRepository {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl ServiceRepository for FileServiceRepository {
    async fn list(&self) -> Result<Vec<UpstreamService>> {
        let bytes = tokio::fs::read(&self.path).await.map_err(|e| {
            ServiceError::Configuration(format!(
                "cannot read services config '{}': {}",
                self.path.display(),
                e
            ))
        })?;
        let services: Vec<UpstreamService> = serde_json::from_slice(&bytes)?;
        Ok(services)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tenant::TenantPlan;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("nimbus-{}-{}.json", name, std::process::id()));
        path
    }

    #[tokio::test]
    async fn test_round_trip_through_file() {
        let path = temp_path("tenants-roundtrip");
        let _ = tokio::fs::remove_file(&path).await;

        let repo = FileTenantRepository::open(&path).await.unwrap();
        let tenant = Tenant::new("acme", "Acme", TenantPlan::Premium).unwrap();
        repo.upsert(&tenant).await.unwrap();

        // A fresh handle over the same file observes the write.
        let reopened = FileTenantRepository::open(&path).await.unwrap();
        let loaded = reopened.get(&"acme".to_string()).await.unwrap().unwrap();
        assert_eq!(loaded.name, "Acme");
        assert_eq!(loaded.plan, TenantPlan::Premium);

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_missing_tenants_file_starts_empty() {
        let path = temp_path("tenants-missing");
        let _ = tokio::fs::remove_file(&path).await;

        let repo = FileTenantRepository::open(&path).await.unwrap();
        assert!(repo.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_services_file_is_reread_per_list() {
        let path = temp_path("services");
        tokio::fs::write(&path, "[]").await.unwrap();

        let repo = FileServiceRepository::new(&path);
        assert!(repo.list().await.unwrap().is_empty());

        let json = serde_json::json!([{
            "id": "analytics",
            "base_url": "http://a:8010",
            "path_prefix": "/analytics",
            "strip_prefix": true
        }]);
        tokio::fs::write(&path, serde_json::to_vec(&json).unwrap())
            .await
            .unwrap();
        let services = repo.list().await.unwrap();
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].id, "analytics");
        assert_eq!(services[0].health_path, "/health");

        let _ = tokio::fs::remove_file(&path).await;
    }
}
