use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Paid,
    Failed,
    Expired,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Paid => "paid",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Expired => "expired",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TransactionStatus::Pending),
            "paid" => Some(TransactionStatus::Paid),
            "failed" => Some(TransactionStatus::Failed),
            "expired" => Some(TransactionStatus::Expired),
            _ => None,
        }
    }

    /// Terminal states are write-once; only `Pending` may transition.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TransactionStatus::Pending)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentProvider {
    YooMoney,
    Unitpay,
    Freekassa,
    Enot,
    /// Internal settlement against the user's stored balance.
    Balance,
}

impl PaymentProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentProvider::YooMoney => "yoomoney",
            PaymentProvider::Unitpay => "unitpay",
            PaymentProvider::Freekassa => "freekassa",
            PaymentProvider::Enot => "enot",
            PaymentProvider::Balance => "balance",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "yoomoney" => Some(PaymentProvider::YooMoney),
            "unitpay" => Some(PaymentProvider::Unitpay),
            "freekassa" => Some(PaymentProvider::Freekassa),
            "enot" => Some(PaymentProvider::Enot),
            "balance" => Some(PaymentProvider::Balance),
            _ => None,
        }
    }
}

/// What the payment buys. Stored as tagged JSON in the `action` column;
/// every variant carries its required fields, so a transaction cannot be
/// created with a half-specified intent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PaymentAction {
    TopUp,
    NewKey {
        host_name: String,
        plan_id: i64,
        months: i32,
    },
    RenewKey {
        key_id: i64,
        months: i32,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingTransaction {
    /// Generated by us, used as the provider-visible order identifier and
    /// as the idempotency key for settlement.
    pub payment_id: String,
    pub user_id: i64,
    /// Kopeks. Fixed at creation time, never recomputed from callback data.
    pub amount: i64,
    pub provider: PaymentProvider,
    pub action: PaymentAction,
    pub promo_code: Option<String>,
    pub status: TransactionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_round_trips_through_tagged_json() {
        let action = PaymentAction::NewKey {
            host_name: "nl-1".to_string(),
            plan_id: 7,
            months: 3,
        };
        let raw = serde_json::to_string(&action).unwrap();
        assert!(raw.contains("\"type\":\"new_key\""));
        let back: PaymentAction = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, action);
    }

    #[test]
    fn half_specified_action_is_rejected() {
        let err = serde_json::from_str::<PaymentAction>(r#"{"type":"renew_key","months":1}"#);
        assert!(err.is_err());
    }

    #[test]
    fn status_strings_round_trip() {
        for status in [
            TransactionStatus::Pending,
            TransactionStatus::Paid,
            TransactionStatus::Failed,
            TransactionStatus::Expired,
        ] {
            assert_eq!(TransactionStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TransactionStatus::parse("refunded"), None);
    }

    #[test]
    fn only_pending_is_non_terminal() {
        assert!(!TransactionStatus::Pending.is_terminal());
        assert!(TransactionStatus::Paid.is_terminal());
        assert!(TransactionStatus::Failed.is_terminal());
        assert!(TransactionStatus::Expired.is_terminal());
    }
}
