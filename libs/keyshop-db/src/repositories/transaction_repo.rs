use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};

use super::StoreError;
use crate::models::transaction::{
    PaymentProvider, PendingTransaction, TransactionStatus,
};

#[derive(Debug, Clone)]
pub struct TransactionRepository {
    pool: PgPool,
}

impl TransactionRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_transaction(row: &PgRow) -> Result<PendingTransaction> {
        let provider_raw: String = row.try_get("provider")?;
        let action_raw: String = row.try_get("action")?;
        let status_raw: String = row.try_get("status")?;
        Ok(PendingTransaction {
            payment_id: row.try_get("payment_id")?,
            user_id: row.try_get("user_id")?,
            amount: row.try_get("amount")?,
            provider: PaymentProvider::parse(&provider_raw)
                .ok_or_else(|| anyhow::anyhow!("unknown provider {provider_raw:?}"))?,
            action: serde_json::from_str(&action_raw).context("malformed action payload")?,
            promo_code: row.try_get::<Option<String>, _>("promo_code").ok().flatten(),
            status: TransactionStatus::parse(&status_raw)
                .ok_or_else(|| anyhow::anyhow!("unknown status {status_raw:?}"))?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    pub async fn create(&self, txn: &PendingTransaction) -> Result<(), StoreError> {
        let action = serde_json::to_string(&txn.action)?;
        let result = sqlx::query(
            "INSERT INTO pending_transactions \
             (payment_id, user_id, amount, provider, action, promo_code, status) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&txn.payment_id)
        .bind(txn.user_id)
        .bind(txn.amount)
        .bind(txn.provider.as_str())
        .bind(&action)
        .bind(&txn.promo_code)
        .bind(txn.status.as_str())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::DuplicateId(txn.payment_id.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_by_payment_id(&self, payment_id: &str) -> Result<Option<PendingTransaction>> {
        let row = sqlx::query("SELECT * FROM pending_transactions WHERE payment_id = $1")
            .bind(payment_id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch transaction")?;
        row.map(|r| Self::row_to_transaction(&r)).transpose()
    }

    /// The serialization point of settlement: one statement that reports the
    /// status a transaction had *before* this call and rewrites it only if it
    /// was still `pending`. Terminal rows are left untouched, so the caller
    /// can tell "we won" (`pending`), "duplicate" (`paid`) and "too late"
    /// (`failed`/`expired`) apart without a second query or a held lock.
    pub async fn set_status(
        &self,
        payment_id: &str,
        status: TransactionStatus,
    ) -> Result<Option<TransactionStatus>> {
        let prev: Option<String> = sqlx::query_scalar(
            "UPDATE pending_transactions AS t \
             SET status = CASE WHEN p.prev = 'pending' THEN $2 ELSE t.status END, \
                 updated_at = CURRENT_TIMESTAMP \
             FROM (SELECT payment_id, status AS prev FROM pending_transactions \
                   WHERE payment_id = $1 FOR UPDATE) AS p \
             WHERE t.payment_id = p.payment_id \
             RETURNING p.prev",
        )
        .bind(payment_id)
        .bind(status.as_str())
        .fetch_optional(&self.pool)
        .await
        .context("Failed to update transaction status")?;

        prev.map(|s| {
            TransactionStatus::parse(&s).ok_or_else(|| anyhow::anyhow!("unknown status {s:?}"))
        })
        .transpose()
    }

    /// Flips pending rows older than the cutoff to `expired`. Rows stay in
    /// the table as audit records.
    pub async fn expire_stale(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE pending_transactions \
             SET status = 'expired', updated_at = CURRENT_TIMESTAMP \
             WHERE status = 'pending' AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await
        .context("Failed to expire stale transactions")?;
        Ok(result.rows_affected())
    }
}
