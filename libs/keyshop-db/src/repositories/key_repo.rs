use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::store::VpnKey;

#[derive(Debug, Clone)]
pub struct KeyRepository {
    pool: PgPool,
}

impl KeyRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_id(&self, id: i64) -> Result<Option<VpnKey>> {
        let key = sqlx::query_as::<_, VpnKey>(
            "SELECT id, user_id, host_name, client_uuid, key_email, expiry_ms, created_at \
             FROM vpn_keys WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch key by ID")?;
        Ok(key)
    }

    pub async fn create(
        &self,
        user_id: i64,
        host_name: &str,
        client_uuid: &str,
        key_email: &str,
        expiry_ms: i64,
    ) -> Result<i64> {
        let id: i64 = sqlx::query_scalar(
            "INSERT INTO vpn_keys (user_id, host_name, client_uuid, key_email, expiry_ms) \
             VALUES ($1, $2, $3, $4, $5) RETURNING id",
        )
        .bind(user_id)
        .bind(host_name)
        .bind(client_uuid)
        .bind(key_email)
        .bind(expiry_ms)
        .fetch_one(&self.pool)
        .await
        .context("Failed to create key record")?;
        Ok(id)
    }

    pub async fn update_expiry(&self, id: i64, expiry_ms: i64) -> Result<()> {
        sqlx::query("UPDATE vpn_keys SET expiry_ms = $1 WHERE id = $2")
            .bind(expiry_ms)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("Failed to update key expiry")?;
        Ok(())
    }
}
