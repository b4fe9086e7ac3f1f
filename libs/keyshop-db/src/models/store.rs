use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub tg_id: i64,
    pub username: Option<String>,
    /// Kopeks, like every monetary value in the schema.
    pub balance: i64,
    pub total_spent: i64,
    pub referred_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// A remote 3x-ui panel plus everything needed to render a client link.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Host {
    pub host_name: String,
    pub panel_url: String,
    pub panel_username: String,
    pub panel_password: String,
    pub inbound_id: i64,
    pub public_host: String,
    pub public_port: i32,
    pub reality_pbk: Option<String>,
    pub reality_sni: Option<String>,
    pub reality_sid: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Plan {
    pub id: i64,
    pub host_name: String,
    pub plan_name: String,
    pub months: i32,
    pub price: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VpnKey {
    pub id: i64,
    pub user_id: i64,
    pub host_name: String,
    pub client_uuid: String,
    pub key_email: String,
    pub expiry_ms: i64,
    pub created_at: DateTime<Utc>,
}
