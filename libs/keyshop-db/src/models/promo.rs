use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PromoCode {
    pub id: i64,
    pub code: String,
    pub discount_percent: Option<i32>,
    /// Fixed discount in kopeks, applied after the percentage.
    pub discount_amount: Option<i64>,
    pub max_uses: i32,
    pub used_count: i32,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PromoCodeUsage {
    pub id: i64,
    pub promo_code_id: i64,
    pub user_id: i64,
    pub used_at: DateTime<Utc>,
}
