use crate::services::payment::{load_adapter, AdapterError, PaymentRequest};
use crate::services::pricing;
use crate::services::settlement::{SettlementEngine, SettlementError, SettlementOutcome};
use chrono::Utc;
use keyshop_db::models::transaction::{
    PaymentAction, PaymentProvider, PendingTransaction, TransactionStatus,
};
use keyshop_db::repositories::{
    CatalogRepository, KeyRepository, PromoRepository, SettingsRepository, StoreError,
    TransactionRepository, UserRepository,
};
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("payment method is temporarily unavailable")]
    ProviderUnavailable,
    #[error("unknown plan {0}")]
    PlanNotFound(i64),
    #[error("unknown key {0}")]
    KeyNotFound(i64),
    #[error("promo code is not valid")]
    PromoInvalid,
    #[error("amount must be positive")]
    InvalidAmount,
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct CheckoutRedirect {
    pub payment_id: String,
    pub url: String,
    /// The quoted amount in kopeks, after all server-side discounts.
    pub amount: i64,
}

/// The pre-payment half of the pipeline: quote a price, write the pending
/// transaction, hand back the provider redirect. Settlement picks up from
/// the webhook (or inline, for balance payments).
pub struct CheckoutService {
    users: UserRepository,
    catalog: CatalogRepository,
    keys: KeyRepository,
    promos: PromoRepository,
    transactions: TransactionRepository,
    settings: SettingsRepository,
    engine: Arc<SettlementEngine>,
}

impl CheckoutService {
    pub fn new(pool: PgPool, engine: Arc<SettlementEngine>) -> Self {
        Self {
            users: UserRepository::new(pool.clone()),
            catalog: CatalogRepository::new(pool.clone()),
            keys: KeyRepository::new(pool.clone()),
            promos: PromoRepository::new(pool.clone()),
            transactions: TransactionRepository::new(pool.clone()),
            settings: SettingsRepository::new(pool),
            engine,
        }
    }

    pub async fn begin_purchase(
        &self,
        user_id: i64,
        plan_id: i64,
        key_id: Option<i64>,
        provider: PaymentProvider,
        promo_code: Option<String>,
    ) -> Result<CheckoutRedirect, CheckoutError> {
        let (amount, action, months) = self
            .quote_purchase(user_id, plan_id, key_id, promo_code.as_deref())
            .await?;
        let description = format!("VPN access, {} month(s) (user {})", months, user_id);
        self.begin(user_id, amount, action, provider, promo_code, description)
            .await
    }

    pub async fn begin_top_up(
        &self,
        user_id: i64,
        amount: i64,
        provider: PaymentProvider,
    ) -> Result<CheckoutRedirect, CheckoutError> {
        if amount <= 0 {
            return Err(CheckoutError::InvalidAmount);
        }
        let description = format!("Balance top-up (user {})", user_id);
        self.begin(user_id, amount, PaymentAction::TopUp, provider, None, description)
            .await
    }

    /// Balance settlement is synchronous: the debit, the audit transaction
    /// and the dispatch all happen before this returns.
    pub async fn pay_with_balance(
        &self,
        user_id: i64,
        plan_id: i64,
        key_id: Option<i64>,
        promo_code: Option<String>,
    ) -> Result<SettlementOutcome, CheckoutError> {
        let (amount, action, _) = self
            .quote_purchase(user_id, plan_id, key_id, promo_code.as_deref())
            .await?;
        match self
            .engine
            .pay_with_balance(user_id, amount, action, promo_code)
            .await
        {
            Ok(outcome) => Ok(outcome),
            Err(SettlementError::InsufficientBalance) => Err(CheckoutError::InsufficientBalance),
            Err(e) => Err(CheckoutError::Internal(anyhow::Error::new(e))),
        }
    }

    async fn begin(
        &self,
        user_id: i64,
        amount: i64,
        action: PaymentAction,
        provider: PaymentProvider,
        promo_code: Option<String>,
        description: String,
    ) -> Result<CheckoutRedirect, CheckoutError> {
        let adapter = load_adapter(provider, &self.settings)
            .await?
            .ok_or(CheckoutError::ProviderUnavailable)?;

        let payment_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let txn = PendingTransaction {
            payment_id: payment_id.clone(),
            user_id,
            amount,
            provider,
            action,
            promo_code,
            status: TransactionStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        match self.transactions.create(&txn).await {
            Ok(()) => {}
            Err(StoreError::DuplicateId(id)) => {
                // A v4 collision is practically impossible; if it happens we
                // want the incident, not a silent retry.
                return Err(CheckoutError::Internal(anyhow::anyhow!(
                    "payment id collision: {id}"
                )));
            }
            Err(e) => return Err(CheckoutError::Internal(e.into())),
        }

        let url = adapter
            .payment_url(&PaymentRequest {
                payment_id: payment_id.clone(),
                amount,
                description,
            })
            .map_err(|e| match e {
                AdapterError::MissingCredentials(_) => CheckoutError::ProviderUnavailable,
                other => CheckoutError::Internal(anyhow::Error::new(other)),
            })?;

        tracing::info!(
            provider = ?adapter.provider(),
            payment_id = %payment_id,
            amount,
            "created pending transaction"
        );

        Ok(CheckoutRedirect {
            payment_id,
            url,
            amount,
        })
    }

    /// The server-computed price is authoritative: there is no client-supplied
    /// override. Renewals are validated against the key table before any money
    /// moves.
    async fn quote_purchase(
        &self,
        user_id: i64,
        plan_id: i64,
        key_id: Option<i64>,
        promo_code: Option<&str>,
    ) -> Result<(i64, PaymentAction, i32), CheckoutError> {
        let plan = self
            .catalog
            .get_plan_by_id(plan_id)
            .await?
            .ok_or(CheckoutError::PlanNotFound(plan_id))?;

        let action = match key_id {
            Some(key_id) => {
                if self.keys.get_by_id(key_id).await?.is_none() {
                    return Err(CheckoutError::KeyNotFound(key_id));
                }
                PaymentAction::RenewKey {
                    key_id,
                    months: plan.months,
                }
            }
            None => PaymentAction::NewKey {
                host_name: plan.host_name.clone(),
                plan_id: plan.id,
                months: plan.months,
            },
        };

        let mut amount = plan.price;
        if let Some(user) = self.users.get(user_id).await? {
            if pricing::eligible_for_referral_discount(&user) {
                let percent = self
                    .settings
                    .get("referral_discount")
                    .await?
                    .and_then(|v| v.parse::<f64>().ok())
                    .unwrap_or(0.0);
                amount = pricing::referral_price(amount, percent);
            }
        }
        if let Some(code) = promo_code {
            let promo = self
                .promos
                .validate(code)
                .await?
                .ok_or(CheckoutError::PromoInvalid)?;
            amount = pricing::promo_price(amount, &promo);
        }

        Ok((amount, action, plan.months))
    }
}
