use anyhow::{Context, Result};
use sqlx::PgPool;

/// Runtime key-value settings (provider credentials, discount percentages).
/// Kept in the database rather than the config file so they can be rotated
/// without a restart.
#[derive(Debug, Clone)]
pub struct SettingsRepository {
    pool: PgPool,
}

impl SettingsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM bot_settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch setting")?;
        Ok(value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()))
    }
}
