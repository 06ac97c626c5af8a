use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, ServiceError};
use crate::types::TenantId;

/// Lifecycle status of a tenant. Deleted tenants keep their id forever; ids
/// are never reused.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TenantStatus {
    Active,
    Suspended,
    Deleted,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TenantPlan {
    Free,
    Basic,
    Premium,
    Enterprise,
}

impl Default for TenantPlan {
    fn default() -> Self {
        Self::Free
    }
}

/// Numeric quotas. Absent keys inherit from the plan defaults at
/// resolution time.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TenantLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_hour: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_day: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_bytes: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrent_requests: Option<u64>,
}

/// Fully resolved quota set, with every plan default applied.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResolvedLimits {
    pub requests_per_minute: u64,
    pub requests_per_hour: u64,
    pub requests_per_day: u64,
    pub storage_bytes: u64,
    pub concurrent_requests: u64,
}

impl TenantPlan {
    pub fn default_limits(&self) -> ResolvedLimits {
        match self {
            TenantPlan::Free => ResolvedLimits {
                requests_per_minute: 60,
                requests_per_hour: 1_000,
                requests_per_day: 10_000,
                storage_bytes: 1 << 30,
                concurrent_requests: 10,
            },
            TenantPlan::Basic => ResolvedLimits {
                requests_per_minute: 300,
                requests_per_hour: 10_000,
                requests_per_day: 100_000,
                storage_bytes: 10 << 30,
                concurrent_requests: 50,
            },
            TenantPlan::Premium => ResolvedLimits {
                requests_per_minute: 1_000,
                requests_per_hour: 50_000,
                requests_per_day: 500_000,
                storage_bytes: 100 << 30,
                concurrent_requests: 200,
            },
            TenantPlan::Enterprise => ResolvedLimits {
                requests_per_minute: 5_000,
                requests_per_hour: 250_000,
                requests_per_day: 2_000_000,
                storage_bytes: 1 << 40,
                concurrent_requests: 1_000,
            },
        }
    }
}

impl TenantLimits {
    pub fn resolve(&self, plan: TenantPlan) -> ResolvedLimits {
        let defaults = plan.default_limits();
        ResolvedLimits {
            requests_per_minute: self
                .requests_per_minute
                .unwrap_or(defaults.requests_per_minute),
            requests_per_hour: self.requests_per_hour.unwrap_or(defaults.requests_per_hour),
            requests_per_day: self.requests_per_day.unwrap_or(defaults.requests_per_day),
            storage_bytes: self.storage_bytes.unwrap_or(defaults.storage_bytes),
            concurrent_requests: self
                .concurrent_requests
                .unwrap_or(defaults.concurrent_requests),
        }
    }
}

/// Logical account boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    pub id: TenantId,
    pub name: String,
    pub status: TenantStatus,
    #[serde(default)]
    pub plan: TenantPlan,
    #[serde(default)]
    pub limits: TenantLimits,
    #[serde(default)]
    pub custom_domains: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn new(id: &str, name: &str, plan: TenantPlan) -> Result<Self> {
        validate_tenant_id(id)?;
        let now = Utc::now();
        Ok(Self {
            id: id.to_string(),
            name: name.to_string(),
            status: TenantStatus::Active,
            plan,
            limits: TenantLimits::default(),
            custom_domains: Vec::new(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn is_active(&self) -> bool {
        self.status == TenantStatus::Active
    }

    pub fn resolved_limits(&self) -> ResolvedLimits {
        self.limits.resolve(self.plan)
    }
}

/// Tenant ids are DNS-label-shaped: 1..=63 chars, lowercase alphanumeric
/// plus '-', no leading or trailing '-'.
pub fn validate_tenant_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 63
        && !id.starts_with('-')
        && !id.ends_with('-')
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if valid {
        Ok(())
    } else {
        Err(ServiceError::Validation(format!(
            "tenant id '{}' is not a valid DNS label",
            id
        )))
    }
}

/// Rejects a catalog where two tenants claim the same custom domain.
/// Domains are compared case-insensitively.
pub fn validate_custom_domains(tenants: &[Tenant]) -> Result<()> {
    let mut seen: std::collections::HashMap<String, &str> = std::collections::HashMap::new();
    for tenant in tenants {
        for domain in &tenant.custom_domains {
            let key = domain.to_ascii_lowercase();
            if let Some(owner) = seen.insert(key, &tenant.id) {
                if owner != tenant.id {
                    return Err(ServiceError::Validation(format!(
                        "custom domain '{}' is claimed by both '{}' and '{}'",
                        domain, owner, tenant.id
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tenant_id_validation() {
        assert!(validate_tenant_id("acme").is_ok());
        assert!(validate_tenant_id("acme-corp-2").is_ok());
        assert!(validate_tenant_id("").is_err());
        assert!(validate_tenant_id("-acme").is_err());
        assert!(validate_tenant_id("acme-").is_err());
        assert!(validate_tenant_id("Acme").is_err());
        assert!(validate_tenant_id("a".repeat(64).as_str()).is_err());
    }

    #[test]
    fn test_limits_inherit_from_plan() {
        let limits = TenantLimits {
            requests_per_minute: Some(5),
            ..Default::default()
        };
        let resolved = limits.resolve(TenantPlan::Basic);
        assert_eq!(resolved.requests_per_minute, 5);
        assert_eq!(resolved.requests_per_hour, 10_000);
        assert_eq!(resolved.concurrent_requests, 50);
    }

    #[test]
    fn test_plan_defaults_are_ordered() {
        let free = TenantPlan::Free.default_limits();
        let enterprise = TenantPlan::Enterprise.default_limits();
        assert!(enterprise.requests_per_minute > free.requests_per_minute);
        assert!(enterprise.storage_bytes > free.storage_bytes);
    }

    #[test]
    fn test_duplicate_custom_domains_rejected() {
        let mut a = Tenant::new("acme", "Acme", TenantPlan::Free).unwrap();
        a.custom_domains.push("app.acme.com".to_string());
        let mut b = Tenant::new("beta", "Beta", TenantPlan::Free).unwrap();
        b.custom_domains.push("APP.ACME.COM".to_string());

        assert!(validate_custom_domains(&[a.clone()]).is_ok());
        assert!(validate_custom_domains(&[a, b]).is_err());
    }

    #[test]
    fn test_deleted_tenant_is_not_active() {
        let mut tenant = Tenant::new("acme", "Acme", TenantPlan::Free).unwrap();
        tenant.status = TenantStatus::Deleted;
        assert!(!tenant.is_active());
    }
}
