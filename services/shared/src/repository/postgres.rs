//! Postgres backends over sqlx.
//!
//! Queries are runtime-checked (`sqlx::query` + binds); limits and domain
//! sets ride in jsonb columns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::error::{Result, ServiceError};
use crate::repository::{ServiceRepository, TenantRepository};
use crate::tenant::{Tenant, TenantLimits, TenantPlan, TenantStatus};
use crate::types::TenantId;
use crate::upstream::UpstreamService;

const TENANT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
    id             TEXT PRIMARY KEY,
    name           TEXT NOT NULL,
    status         TEXT NOT NULL,
    plan           TEXT NOT NULL,
    limits         JSONB NOT NULL DEFAULT '{}'::jsonb,
    custom_domains JSONB NOT NULL DEFAULT '[]'::jsonb,
    created_at     TIMESTAMPTZ NOT NULL,
    updated_at     TIMESTAMPTZ NOT NULL
)
"#;

const SERVICE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS services (
    id      TEXT PRIMARY KEY,
    ordinal INT NOT NULL,
    record  JSONB NOT NULL
)
"#;

fn status_to_str(status: TenantStatus) -> &'static str {
    match status {
        TenantStatus::Active => "active",
        TenantStatus::Suspended => "suspended",
        TenantStatus::Deleted => "deleted",
    }
}

fn status_from_str(s: &str) -> Result<TenantStatus> {
    match s {
        "active" => Ok(TenantStatus::Active),
        "suspended" => Ok(TenantStatus::Suspended),
        "deleted" => Ok(TenantStatus::Deleted),
        other => Err(ServiceError::Internal(format!(
            "unknown tenant status '{}' in store",
            other
        ))),
    }
}

fn plan_to_str(plan: TenantPlan) -> &'static str {
    match plan {
        TenantPlan::Free => "free",
        TenantPlan::Basic => "basic",
        TenantPlan::Premium => "premium",
        TenantPlan::Enterprise => "enterprise",
    }
}

fn plan_from_str(s: &str) -> Result<TenantPlan> {
    match s {
        "free" => Ok(TenantPlan::Free),
        "basic" => Ok(TenantPlan::Basic),
        "premium" => Ok(TenantPlan::Premium),
        "enterprise" => Ok(TenantPlan::Enterprise),
        other => Err(ServiceError::Internal(format!(
            "unknown tenant plan '{}' in store",
            other
        ))),
    }
}

fn row_to_tenant(row: &sqlx::postgres::PgRow) -> Result<Tenant> {
    let limits: serde_json::Value = row.try_get("limits")?;
    let custom_domains: serde_json::Value = row.try_get("custom_domains")?;
    let status: String = row.try_get("status")?;
    let plan: String = row.try_get("plan")?;
    let created_at: DateTime<Utc> = row.try_get("created_at")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(Tenant {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        status: status_from_str(&status)?,
        plan: plan_from_str(&plan)?,
        limits: serde_json::from_value::<TenantLimits>(limits)?,
        custom_domains: serde_json::from_value(custom_domains)?,
        created_at,
        updated_at,
    })
}

pub struct PostgresTenantRepository {
    pool: PgPool,
}

impl PostgresTenantRepository {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        sqlx::query(TENANT_SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TenantRepository for PostgresTenantRepository {
    async fn list(&self) -> Result<Vec<Tenant>> {
        let rows = sqlx::query("SELECT * FROM tenants ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_tenant).collect()
    }

    async fn get(&self, id: &TenantId) -> Result<Option<Tenant>> {
        let row = sqlx::query("SELECT * FROM tenants WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_tenant).transpose()
    }

    async fn upsert(&self, tenant: &Tenant) -> Result<Tenant> {
        sqlx::query(
            r#"
            INSERT INTO tenants (id, name, status, plan, limits, custom_domains, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                status = EXCLUDED.status,
                plan = EXCLUDED.plan,
                limits = EXCLUDED.limits,
                custom_domains = EXCLUDED.custom_domains,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&tenant.id)
        .bind(&tenant.name)
        .bind(status_to_str(tenant.status))
        .bind(plan_to_str(tenant.plan))
        .bind(serde_json::to_value(&tenant.limits)?)
        .bind(serde_json::to_value(&tenant.custom_domains)?)
        .bind(tenant.created_at)
        .bind(tenant.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(tenant.clone())
    }

    async fn delete(&self, id: &TenantId) -> Result<()> {
        let result = sqlx::query(
            "UPDATE tenants SET status = 'deleted', updated_at = $2 WHERE id = $1",
        )
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(ServiceError::NotFound(format!("tenant '{}'", id)));
        }
        Ok(())
    }
}

pub struct PostgresServiceRepository {
    pool: PgPool,
}

impl PostgresServiceRepository {
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(url)
            .await?;
        sqlx::query(SERVICE_SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ServiceRepository for PostgresServiceRepository {
    async fn list(&self) -> Result<Vec<UpstreamService>> {
        let rows = sqlx::query("SELECT record FROM services ORDER BY ordinal, id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                let record: serde_json::Value = row.try_get("record")?;
                Ok(serde_json::from_value::<UpstreamService>(record)?)
            })
            .collect()
    }
}
