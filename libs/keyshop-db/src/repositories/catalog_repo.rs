use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::store::{Host, Plan};

#[derive(Debug, Clone)]
pub struct CatalogRepository {
    pool: PgPool,
}

impl CatalogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_host_by_name(&self, host_name: &str) -> Result<Option<Host>> {
        let host = sqlx::query_as::<_, Host>("SELECT * FROM hosts WHERE host_name = $1")
            .bind(host_name)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch host")?;
        Ok(host)
    }

    pub async fn get_plan_by_id(&self, id: i64) -> Result<Option<Plan>> {
        let plan = sqlx::query_as::<_, Plan>(
            "SELECT id, host_name, plan_name, months, price FROM plans WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch plan")?;
        Ok(plan)
    }
}
