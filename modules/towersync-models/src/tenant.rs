use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::error::Result;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Tenant {
    pub id: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub name: String,
    pub external_tenant: Option<String>,
    pub description: Option<String>,
}

/// Look a tenant up by id. The persister never creates tenants.
pub async fn find_tenant(pool: &PgPool, id: i64) -> Result<Option<Tenant>> {
    let row = sqlx::query_as::<_, Tenant>("SELECT * FROM tenants WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row)
}
