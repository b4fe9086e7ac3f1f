use anyhow::{Context, Result};
use sqlx::PgPool;

use crate::models::store::User;

#[derive(Debug, Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, tg_id: i64) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            "SELECT tg_id, username, balance, total_spent, referred_by, created_at \
             FROM users WHERE tg_id = $1",
        )
        .bind(tg_id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch user")?;
        Ok(user)
    }

    /// Atomic credit; creates the account row on first top-up. Returns the
    /// balance after the credit.
    pub async fn credit_balance(&self, tg_id: i64, amount: i64) -> Result<i64> {
        let balance: i64 = sqlx::query_scalar(
            "INSERT INTO users (tg_id, balance) VALUES ($1, $2) \
             ON CONFLICT (tg_id) DO UPDATE SET balance = users.balance + excluded.balance \
             RETURNING balance",
        )
        .bind(tg_id)
        .bind(amount)
        .fetch_one(&self.pool)
        .await
        .context("Failed to credit balance")?;
        Ok(balance)
    }

    /// Check-and-debit in one statement; never drives the balance negative.
    /// Returns false when funds are insufficient (no mutation happened).
    pub async fn try_debit_balance(&self, tg_id: i64, amount: i64) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE users SET balance = balance - $1 WHERE tg_id = $2 AND balance >= $1",
        )
        .bind(amount)
        .bind(tg_id)
        .execute(&self.pool)
        .await
        .context("Failed to debit balance")?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn mark_spent(&self, tg_id: i64, amount: i64) -> Result<()> {
        sqlx::query("UPDATE users SET total_spent = total_spent + $1 WHERE tg_id = $2")
            .bind(amount)
            .bind(tg_id)
            .execute(&self.pool)
            .await
            .context("Failed to update total spent")?;
        Ok(())
    }
}
