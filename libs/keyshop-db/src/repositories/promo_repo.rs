use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::PgPool;

use crate::models::promo::PromoCode;

#[derive(Debug, Clone)]
pub struct PromoRepository {
    pool: PgPool,
}

impl PromoRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn validate(&self, code: &str) -> Result<Option<PromoCode>> {
        sqlx::query_as::<_, PromoCode>(
            "SELECT id, code, discount_percent, discount_amount, max_uses, used_count, \
                    expires_at, is_active, created_at \
             FROM promo_codes \
             WHERE code = $1 AND is_active = TRUE AND used_count < max_uses \
               AND (expires_at IS NULL OR expires_at > $2)",
        )
        .bind(code)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to validate promo code")
    }

    /// Burns one use of the code and journals who spent it. Returns false if
    /// the code was no longer consumable (exhausted, disabled or expired in
    /// the meantime); nothing is written in that case.
    pub async fn consume(&self, code: &str, user_id: i64) -> Result<bool> {
        let mut tx = self.pool.begin().await.context("Failed to open transaction")?;

        let promo_id: Option<i64> = sqlx::query_scalar(
            "UPDATE promo_codes SET used_count = used_count + 1 \
             WHERE code = $1 AND is_active = TRUE AND used_count < max_uses \
               AND (expires_at IS NULL OR expires_at > $2) \
             RETURNING id",
        )
        .bind(code)
        .bind(Utc::now())
        .fetch_optional(&mut *tx)
        .await
        .context("Failed to consume promo code")?;

        let Some(promo_id) = promo_id else {
            return Ok(false);
        };

        sqlx::query("INSERT INTO promo_code_usages (promo_code_id, user_id) VALUES ($1, $2)")
            .bind(promo_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .context("Failed to journal promo usage")?;

        tx.commit().await.context("Failed to commit promo usage")?;
        Ok(true)
    }
}
