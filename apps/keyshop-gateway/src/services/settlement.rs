use crate::notify::Notifier;
use crate::panel::{ProvisionError, Provisioner};
use crate::services::payment::{format_amount, CallbackNotification};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use keyshop_db::models::store::{Host, VpnKey};
use keyshop_db::models::transaction::{
    PaymentAction, PaymentProvider, PendingTransaction, TransactionStatus,
};
use keyshop_db::repositories::{
    CatalogRepository, KeyRepository, PromoRepository, StoreError, TransactionRepository,
    UserRepository,
};
use rand::Rng;
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;

/// Tolerated gap between the stored amount and what a provider reports,
/// in kopeks. Covers provider-side decimal rounding.
const AMOUNT_TOLERANCE: i64 = 1;

pub const DAYS_PER_MONTH: i64 = 30;

const SUPPORT_MSG: &str =
    "Payment received, but we could not provision your key. Please contact support.";

#[derive(Debug, Error)]
pub enum SettlementError {
    #[error("no pending transaction for payment id {0}")]
    TransactionNotFound(String),
    #[error("amount mismatch for {payment_id}: stored {stored}, reported {reported}")]
    AmountMismatch {
        payment_id: String,
        stored: i64,
        reported: i64,
    },
    #[error("transaction {payment_id} is already {status:?}")]
    AlreadyTerminal {
        payment_id: String,
        status: TransactionStatus,
    },
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// First delivery: side effects performed.
    Settled,
    /// Duplicate delivery: acknowledged with zero side effects.
    AlreadySettled,
}

/// Everything the engine touches in the data store. The production
/// implementation delegates to the sqlx repositories; tests swap in fakes.
#[async_trait]
pub trait SettlementStore: Send + Sync {
    async fn create_transaction(&self, txn: &PendingTransaction) -> Result<(), StoreError>;
    async fn transaction(&self, payment_id: &str) -> Result<Option<PendingTransaction>>;
    /// Atomic status gate; returns the status the row had before the call,
    /// or None when the row does not exist. Must only rewrite `Pending`.
    async fn set_status(
        &self,
        payment_id: &str,
        status: TransactionStatus,
    ) -> Result<Option<TransactionStatus>>;
    async fn credit_balance(&self, user_id: i64, amount: i64) -> Result<i64>;
    /// Guarded debit; false means insufficient funds and no mutation.
    async fn debit_balance(&self, user_id: i64, amount: i64) -> Result<bool>;
    async fn mark_spent(&self, user_id: i64, amount: i64) -> Result<()>;
    async fn host_by_name(&self, host_name: &str) -> Result<Option<Host>>;
    async fn key_by_id(&self, key_id: i64) -> Result<Option<VpnKey>>;
    async fn record_key(
        &self,
        user_id: i64,
        host_name: &str,
        client_uuid: &str,
        key_email: &str,
        expiry_ms: i64,
    ) -> Result<i64>;
    async fn update_key_expiry(&self, key_id: i64, expiry_ms: i64) -> Result<()>;
    async fn consume_promo(&self, code: &str, user_id: i64) -> Result<bool>;
}

#[derive(Clone)]
pub struct PgSettlementStore {
    transactions: TransactionRepository,
    users: UserRepository,
    keys: KeyRepository,
    catalog: CatalogRepository,
    promos: PromoRepository,
}

impl PgSettlementStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            transactions: TransactionRepository::new(pool.clone()),
            users: UserRepository::new(pool.clone()),
            keys: KeyRepository::new(pool.clone()),
            catalog: CatalogRepository::new(pool.clone()),
            promos: PromoRepository::new(pool),
        }
    }
}

#[async_trait]
impl SettlementStore for PgSettlementStore {
    async fn create_transaction(&self, txn: &PendingTransaction) -> Result<(), StoreError> {
        self.transactions.create(txn).await
    }

    async fn transaction(&self, payment_id: &str) -> Result<Option<PendingTransaction>> {
        self.transactions.get_by_payment_id(payment_id).await
    }

    async fn set_status(
        &self,
        payment_id: &str,
        status: TransactionStatus,
    ) -> Result<Option<TransactionStatus>> {
        self.transactions.set_status(payment_id, status).await
    }

    async fn credit_balance(&self, user_id: i64, amount: i64) -> Result<i64> {
        self.users.credit_balance(user_id, amount).await
    }

    async fn debit_balance(&self, user_id: i64, amount: i64) -> Result<bool> {
        self.users.try_debit_balance(user_id, amount).await
    }

    async fn mark_spent(&self, user_id: i64, amount: i64) -> Result<()> {
        self.users.mark_spent(user_id, amount).await
    }

    async fn host_by_name(&self, host_name: &str) -> Result<Option<Host>> {
        self.catalog.get_host_by_name(host_name).await
    }

    async fn key_by_id(&self, key_id: i64) -> Result<Option<VpnKey>> {
        self.keys.get_by_id(key_id).await
    }

    async fn record_key(
        &self,
        user_id: i64,
        host_name: &str,
        client_uuid: &str,
        key_email: &str,
        expiry_ms: i64,
    ) -> Result<i64> {
        self.keys
            .create(user_id, host_name, client_uuid, key_email, expiry_ms)
            .await
    }

    async fn update_key_expiry(&self, key_id: i64, expiry_ms: i64) -> Result<()> {
        self.keys.update_expiry(key_id, expiry_ms).await
    }

    async fn consume_promo(&self, code: &str, user_id: i64) -> Result<bool> {
        self.promos.consume(code, user_id).await
    }
}

/// The reconciliation core: turns a verified paid notification into exactly
/// one of {balance credit, key creation, key renewal}, exactly once.
pub struct SettlementEngine {
    store: Arc<dyn SettlementStore>,
    panel: Arc<dyn Provisioner>,
    notifier: Arc<dyn Notifier>,
}

impl SettlementEngine {
    pub fn new(
        store: Arc<dyn SettlementStore>,
        panel: Arc<dyn Provisioner>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            store,
            panel,
            notifier,
        }
    }

    /// Webhook entry point. The adapter has already authenticated the
    /// notification; this enforces the amount and the idempotency gate.
    pub async fn settle(
        &self,
        note: &CallbackNotification,
    ) -> Result<SettlementOutcome, SettlementError> {
        let txn = self
            .store
            .transaction(&note.payment_id)
            .await?
            .ok_or_else(|| SettlementError::TransactionNotFound(note.payment_id.clone()))?;

        // The stored amount is the settlement amount; the callback value only
        // has to agree with it. A mismatch is a forgery or a provider bug.
        if (txn.amount - note.amount).abs() > AMOUNT_TOLERANCE {
            return Err(SettlementError::AmountMismatch {
                payment_id: txn.payment_id,
                stored: txn.amount,
                reported: note.amount,
            });
        }

        self.settle_transaction(txn).await
    }

    /// Balance purchases bypass providers entirely but share the dispatch
    /// below: one settlement code path, however the money arrived.
    pub async fn pay_with_balance(
        &self,
        user_id: i64,
        amount: i64,
        action: PaymentAction,
        promo_code: Option<String>,
    ) -> Result<SettlementOutcome, SettlementError> {
        if !self.store.debit_balance(user_id, amount).await? {
            return Err(SettlementError::InsufficientBalance);
        }

        let now = Utc::now();
        let txn = PendingTransaction {
            payment_id: uuid::Uuid::new_v4().to_string(),
            user_id,
            amount,
            provider: PaymentProvider::Balance,
            action,
            promo_code,
            status: TransactionStatus::Pending,
            created_at: now,
            updated_at: now,
        };
        // Audit row; settled inline right below.
        self.store
            .create_transaction(&txn)
            .await
            .map_err(|e| SettlementError::Store(e.into()))?;

        self.settle_transaction(txn).await
    }

    async fn settle_transaction(
        &self,
        txn: PendingTransaction,
    ) -> Result<SettlementOutcome, SettlementError> {
        // The single serialization point: whoever reads back `Pending` owns
        // the side effects. No lock is held across the panel call.
        let prev = self
            .store
            .set_status(&txn.payment_id, TransactionStatus::Paid)
            .await?
            .ok_or_else(|| SettlementError::TransactionNotFound(txn.payment_id.clone()))?;

        match prev {
            TransactionStatus::Pending => {}
            TransactionStatus::Paid => {
                tracing::info!(payment_id = %txn.payment_id, "duplicate settlement notification, no-op");
                return Ok(SettlementOutcome::AlreadySettled);
            }
            status => {
                tracing::warn!(
                    payment_id = %txn.payment_id,
                    ?status,
                    "paid notification for a terminal transaction"
                );
                return Err(SettlementError::AlreadyTerminal {
                    payment_id: txn.payment_id,
                    status,
                });
            }
        }

        tracing::info!(
            payment_id = %txn.payment_id,
            user_id = txn.user_id,
            amount = txn.amount,
            provider = ?txn.provider,
            action = ?txn.action,
            "settling transaction"
        );

        // Past this point the payment is captured. Fulfillment failures are
        // reported to the user and the operator, never rolled back.
        if !matches!(txn.action, PaymentAction::TopUp) {
            if let Err(e) = self.store.mark_spent(txn.user_id, txn.amount).await {
                tracing::warn!(payment_id = %txn.payment_id, "failed to record spend: {e:#}");
            }
        }

        match &txn.action {
            PaymentAction::TopUp => self.apply_top_up(&txn).await?,
            PaymentAction::NewKey {
                host_name, months, ..
            } => self.issue_key(&txn, host_name, *months).await?,
            PaymentAction::RenewKey { key_id, months } => {
                self.renew_key(&txn, *key_id, *months).await?
            }
        }

        if let Some(code) = &txn.promo_code {
            // Non-fatal: the user already got what they paid for.
            match self.store.consume_promo(code, txn.user_id).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!(payment_id = %txn.payment_id, code = %code, "promo code was no longer consumable")
                }
                Err(e) => {
                    tracing::warn!(payment_id = %txn.payment_id, code = %code, "failed to consume promo code: {e:#}")
                }
            }
        }

        Ok(SettlementOutcome::Settled)
    }

    async fn apply_top_up(&self, txn: &PendingTransaction) -> Result<(), SettlementError> {
        let balance = self.store.credit_balance(txn.user_id, txn.amount).await?;
        self.send(
            txn.user_id,
            &format!(
                "Balance topped up by {} RUB. Current balance: {} RUB.",
                format_amount(txn.amount),
                format_amount(balance)
            ),
        )
        .await;
        Ok(())
    }

    async fn issue_key(
        &self,
        txn: &PendingTransaction,
        host_name: &str,
        months: i32,
    ) -> Result<(), SettlementError> {
        let Some(host) = self.store.host_by_name(host_name).await? else {
            tracing::error!(
                payment_id = %txn.payment_id,
                host_name,
                "captured payment references an unknown host"
            );
            self.send(txn.user_id, SUPPORT_MSG).await;
            return Ok(());
        };

        let email = generate_key_email(txn.user_id);
        match self
            .panel
            .provision(&host, &email, months as i64 * DAYS_PER_MONTH)
            .await
        {
            Ok(result) => {
                if let Err(e) = self
                    .store
                    .record_key(
                        txn.user_id,
                        host_name,
                        &result.client_uuid,
                        &email,
                        result.expiry_ms,
                    )
                    .await
                {
                    tracing::error!(
                        payment_id = %txn.payment_id,
                        "provisioned key could not be recorded: {e:#}"
                    );
                }
                self.send(
                    txn.user_id,
                    &format!(
                        "Payment received. Your access key:\n{}",
                        result.connection_string
                    ),
                )
                .await;
            }
            Err(e) => self.report_provisioning_failure(txn, e).await,
        }
        Ok(())
    }

    async fn renew_key(
        &self,
        txn: &PendingTransaction,
        key_id: i64,
        months: i32,
    ) -> Result<(), SettlementError> {
        let Some(key) = self.store.key_by_id(key_id).await? else {
            // Captured money with undeliverable goods: the loudest log line
            // in this file, by design of the ops runbook.
            tracing::error!(
                payment_id = %txn.payment_id,
                key_id,
                "renewal was paid for a key that no longer exists"
            );
            self.send(
                txn.user_id,
                "The key you paid to renew was not found. Please contact support.",
            )
            .await;
            return Ok(());
        };

        let Some(host) = self.store.host_by_name(&key.host_name).await? else {
            tracing::error!(
                payment_id = %txn.payment_id,
                host_name = %key.host_name,
                "renewal references an unknown host"
            );
            self.send(txn.user_id, SUPPORT_MSG).await;
            return Ok(());
        };

        match self
            .panel
            .provision(&host, &key.key_email, months as i64 * DAYS_PER_MONTH)
            .await
        {
            Ok(result) => {
                if let Err(e) = self.store.update_key_expiry(key.id, result.expiry_ms).await {
                    tracing::error!(
                        payment_id = %txn.payment_id,
                        key_id,
                        "renewed key expiry could not be recorded: {e:#}"
                    );
                }
                self.send(
                    txn.user_id,
                    &format!(
                        "Key renewed for {} month(s). New expiry: {}.",
                        months,
                        format_expiry(result.expiry_ms)
                    ),
                )
                .await;
            }
            Err(e) => self.report_provisioning_failure(txn, e).await,
        }
        Ok(())
    }

    async fn report_provisioning_failure(&self, txn: &PendingTransaction, err: ProvisionError) {
        // The transaction stays Paid: captured money with failed delivery is
        // an operational incident, not a rollback.
        tracing::error!(
            payment_id = %txn.payment_id,
            user_id = txn.user_id,
            "provisioning failed after capture: {err}"
        );
        self.send(txn.user_id, SUPPORT_MSG).await;
    }

    async fn send(&self, user_id: i64, text: &str) {
        if let Err(e) = self.notifier.notify(user_id, text).await {
            tracing::warn!(user_id, "failed to deliver outcome notification: {e:#}");
        }
    }
}

fn generate_key_email(user_id: i64) -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    let suffix: String = (0..6)
        .map(|_| CHARSET[rng.random_range(0..CHARSET.len())] as char)
        .collect();
    format!("user_{}_{}", user_id, suffix)
}

fn format_expiry(expiry_ms: i64) -> String {
    match chrono::DateTime::from_timestamp_millis(expiry_ms) {
        Some(dt) => dt.format("%Y-%m-%d %H:%M").to_string(),
        None => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::panel::ProvisionResult;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        txns: Mutex<HashMap<String, PendingTransaction>>,
        balances: Mutex<HashMap<i64, i64>>,
        spent: Mutex<HashMap<i64, i64>>,
        hosts: Mutex<HashMap<String, Host>>,
        keys: Mutex<HashMap<i64, VpnKey>>,
        recorded_keys: Mutex<Vec<(i64, String, String)>>,
        consumed_promos: Mutex<Vec<(String, i64)>>,
    }

    #[async_trait]
    impl SettlementStore for FakeStore {
        async fn create_transaction(&self, txn: &PendingTransaction) -> Result<(), StoreError> {
            let mut txns = self.txns.lock().unwrap();
            if txns.contains_key(&txn.payment_id) {
                return Err(StoreError::DuplicateId(txn.payment_id.clone()));
            }
            txns.insert(txn.payment_id.clone(), txn.clone());
            Ok(())
        }

        async fn transaction(&self, payment_id: &str) -> Result<Option<PendingTransaction>> {
            Ok(self.txns.lock().unwrap().get(payment_id).cloned())
        }

        async fn set_status(
            &self,
            payment_id: &str,
            status: TransactionStatus,
        ) -> Result<Option<TransactionStatus>> {
            let mut txns = self.txns.lock().unwrap();
            let Some(row) = txns.get_mut(payment_id) else {
                return Ok(None);
            };
            let prev = row.status;
            if prev == TransactionStatus::Pending {
                row.status = status;
            }
            Ok(Some(prev))
        }

        async fn credit_balance(&self, user_id: i64, amount: i64) -> Result<i64> {
            let mut balances = self.balances.lock().unwrap();
            let balance = balances.entry(user_id).or_insert(0);
            *balance += amount;
            Ok(*balance)
        }

        async fn debit_balance(&self, user_id: i64, amount: i64) -> Result<bool> {
            let mut balances = self.balances.lock().unwrap();
            let balance = balances.entry(user_id).or_insert(0);
            if *balance < amount {
                return Ok(false);
            }
            *balance -= amount;
            Ok(true)
        }

        async fn mark_spent(&self, user_id: i64, amount: i64) -> Result<()> {
            *self.spent.lock().unwrap().entry(user_id).or_insert(0) += amount;
            Ok(())
        }

        async fn host_by_name(&self, host_name: &str) -> Result<Option<Host>> {
            Ok(self.hosts.lock().unwrap().get(host_name).cloned())
        }

        async fn key_by_id(&self, key_id: i64) -> Result<Option<VpnKey>> {
            Ok(self.keys.lock().unwrap().get(&key_id).cloned())
        }

        async fn record_key(
            &self,
            user_id: i64,
            host_name: &str,
            client_uuid: &str,
            _key_email: &str,
            _expiry_ms: i64,
        ) -> Result<i64> {
            let mut recorded = self.recorded_keys.lock().unwrap();
            recorded.push((user_id, host_name.to_string(), client_uuid.to_string()));
            Ok(recorded.len() as i64)
        }

        async fn update_key_expiry(&self, key_id: i64, expiry_ms: i64) -> Result<()> {
            if let Some(key) = self.keys.lock().unwrap().get_mut(&key_id) {
                key.expiry_ms = expiry_ms;
            }
            Ok(())
        }

        async fn consume_promo(&self, code: &str, user_id: i64) -> Result<bool> {
            self.consumed_promos
                .lock()
                .unwrap()
                .push((code.to_string(), user_id));
            Ok(true)
        }
    }

    struct FakePanel {
        calls: AtomicUsize,
        fail: bool,
        expiry_ms: i64,
    }

    impl FakePanel {
        fn succeeding(expiry_ms: i64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
                expiry_ms,
            }
        }

        fn failing() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: true,
                expiry_ms: 0,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provisioner for FakePanel {
        async fn provision(
            &self,
            host: &Host,
            email: &str,
            _days_to_add: i64,
        ) -> Result<ProvisionResult, ProvisionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ProvisionError::Permanent("panel said no".to_string()));
            }
            Ok(ProvisionResult {
                client_uuid: "11111111-2222-3333-4444-555555555555".to_string(),
                connection_string: format!("vless://client@{}:443#{}", host.public_host, email),
                expiry_ms: self.expiry_ms,
            })
        }
    }

    #[derive(Default)]
    struct FakeNotifier {
        messages: Mutex<Vec<(i64, String)>>,
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn notify(&self, user_id: i64, text: &str) -> Result<()> {
            self.messages
                .lock()
                .unwrap()
                .push((user_id, text.to_string()));
            Ok(())
        }
    }

    fn host(name: &str) -> Host {
        Host {
            host_name: name.to_string(),
            panel_url: "https://panel.example:2053".to_string(),
            panel_username: "admin".to_string(),
            panel_password: "secret".to_string(),
            inbound_id: 1,
            public_host: "vpn.example.com".to_string(),
            public_port: 443,
            reality_pbk: None,
            reality_sni: None,
            reality_sid: None,
        }
    }

    fn pending(payment_id: &str, user_id: i64, amount: i64, action: PaymentAction) -> PendingTransaction {
        let now = Utc::now();
        PendingTransaction {
            payment_id: payment_id.to_string(),
            user_id,
            amount,
            provider: PaymentProvider::Freekassa,
            action,
            promo_code: None,
            status: TransactionStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    fn new_key_action() -> PaymentAction {
        PaymentAction::NewKey {
            host_name: "nl-1".to_string(),
            plan_id: 1,
            months: 1,
        }
    }

    fn note(payment_id: &str, amount: i64) -> CallbackNotification {
        CallbackNotification {
            provider: PaymentProvider::Freekassa,
            payment_id: payment_id.to_string(),
            amount,
        }
    }

    struct Fixture {
        store: Arc<FakeStore>,
        panel: Arc<FakePanel>,
        notifier: Arc<FakeNotifier>,
        engine: SettlementEngine,
    }

    fn fixture(panel: FakePanel) -> Fixture {
        let store = Arc::new(FakeStore::default());
        store
            .hosts
            .lock()
            .unwrap()
            .insert("nl-1".to_string(), host("nl-1"));
        let panel = Arc::new(panel);
        let notifier = Arc::new(FakeNotifier::default());
        let engine = SettlementEngine::new(store.clone(), panel.clone(), notifier.clone());
        Fixture {
            store,
            panel,
            notifier,
            engine,
        }
    }

    fn status_of(store: &FakeStore, payment_id: &str) -> TransactionStatus {
        store.txns.lock().unwrap()[payment_id].status
    }

    #[tokio::test]
    async fn top_up_credits_balance_once() {
        let f = fixture(FakePanel::succeeding(1));
        f.store
            .create_transaction(&pending("p-1", 42, 10_000, PaymentAction::TopUp))
            .await
            .unwrap();

        let outcome = f.engine.settle(&note("p-1", 10_000)).await.unwrap();
        assert_eq!(outcome, SettlementOutcome::Settled);
        assert_eq!(f.store.balances.lock().unwrap()[&42], 10_000);
        assert_eq!(status_of(&f.store, "p-1"), TransactionStatus::Paid);

        let messages = f.notifier.messages.lock().unwrap();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].1.contains("100.00"));
    }

    #[tokio::test]
    async fn duplicate_webhook_provisions_exactly_once() {
        let f = fixture(FakePanel::succeeding(1));
        f.store
            .create_transaction(&pending("p-2", 42, 30_000, new_key_action()))
            .await
            .unwrap();

        let first = f.engine.settle(&note("p-2", 30_000)).await.unwrap();
        let second = f.engine.settle(&note("p-2", 30_000)).await.unwrap();

        assert_eq!(first, SettlementOutcome::Settled);
        assert_eq!(second, SettlementOutcome::AlreadySettled);
        assert_eq!(f.panel.call_count(), 1);
        assert_eq!(f.store.recorded_keys.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn amount_mismatch_is_rejected_without_state_change() {
        let f = fixture(FakePanel::succeeding(1));
        f.store
            .create_transaction(&pending("p-3", 42, 30_000, new_key_action()))
            .await
            .unwrap();

        let err = f.engine.settle(&note("p-3", 29_500)).await.unwrap_err();
        assert!(matches!(err, SettlementError::AmountMismatch { .. }));
        assert_eq!(status_of(&f.store, "p-3"), TransactionStatus::Pending);
        assert_eq!(f.panel.call_count(), 0);
        assert!(f.notifier.messages.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn one_kopek_rounding_gap_is_tolerated() {
        let f = fixture(FakePanel::succeeding(1));
        f.store
            .create_transaction(&pending("p-4", 42, 30_000, PaymentAction::TopUp))
            .await
            .unwrap();

        let outcome = f.engine.settle(&note("p-4", 29_999)).await.unwrap();
        assert_eq!(outcome, SettlementOutcome::Settled);
    }

    #[tokio::test]
    async fn unknown_payment_id_is_not_found() {
        let f = fixture(FakePanel::succeeding(1));
        let err = f.engine.settle(&note("missing", 100)).await.unwrap_err();
        assert!(matches!(err, SettlementError::TransactionNotFound(_)));
    }

    #[tokio::test]
    async fn balance_purchase_debits_creates_key_and_audits() {
        let f = fixture(FakePanel::succeeding(1));
        f.store.balances.lock().unwrap().insert(42, 50_000);

        let outcome = f
            .engine
            .pay_with_balance(42, 30_000, new_key_action(), None)
            .await
            .unwrap();

        assert_eq!(outcome, SettlementOutcome::Settled);
        assert_eq!(f.store.balances.lock().unwrap()[&42], 20_000);
        assert_eq!(f.store.recorded_keys.lock().unwrap().len(), 1);
        assert_eq!(f.store.spent.lock().unwrap()[&42], 30_000);

        let txns = f.store.txns.lock().unwrap();
        assert_eq!(txns.len(), 1);
        let txn = txns.values().next().unwrap();
        assert_eq!(txn.status, TransactionStatus::Paid);
        assert_eq!(txn.provider, PaymentProvider::Balance);
        assert_eq!(txn.amount, 30_000);
    }

    #[tokio::test]
    async fn insufficient_balance_rejects_without_mutation() {
        let f = fixture(FakePanel::succeeding(1));
        f.store.balances.lock().unwrap().insert(42, 10_000);

        let err = f
            .engine
            .pay_with_balance(42, 30_000, new_key_action(), None)
            .await
            .unwrap_err();

        assert!(matches!(err, SettlementError::InsufficientBalance));
        assert_eq!(f.store.balances.lock().unwrap()[&42], 10_000);
        assert!(f.store.txns.lock().unwrap().is_empty());
        assert_eq!(f.panel.call_count(), 0);
    }

    #[tokio::test]
    async fn renewal_updates_stored_expiry() {
        let new_expiry = 1_900_000_000_000;
        let f = fixture(FakePanel::succeeding(new_expiry));
        f.store.keys.lock().unwrap().insert(
            5,
            VpnKey {
                id: 5,
                user_id: 42,
                host_name: "nl-1".to_string(),
                client_uuid: "11111111-2222-3333-4444-555555555555".to_string(),
                key_email: "user_42_abc123".to_string(),
                expiry_ms: 1_800_000_000_000,
                created_at: Utc::now(),
            },
        );
        f.store
            .create_transaction(&pending(
                "p-5",
                42,
                30_000,
                PaymentAction::RenewKey { key_id: 5, months: 3 },
            ))
            .await
            .unwrap();

        let outcome = f.engine.settle(&note("p-5", 30_000)).await.unwrap();
        assert_eq!(outcome, SettlementOutcome::Settled);
        assert_eq!(f.panel.call_count(), 1);
        assert_eq!(f.store.keys.lock().unwrap()[&5].expiry_ms, new_expiry);
    }

    #[tokio::test]
    async fn renewal_of_missing_key_never_contacts_panel() {
        let f = fixture(FakePanel::succeeding(1));
        f.store
            .create_transaction(&pending(
                "p-6",
                42,
                30_000,
                PaymentAction::RenewKey { key_id: 99, months: 1 },
            ))
            .await
            .unwrap();

        let outcome = f.engine.settle(&note("p-6", 30_000)).await.unwrap();
        assert_eq!(outcome, SettlementOutcome::Settled);
        assert_eq!(f.panel.call_count(), 0);
        assert_eq!(status_of(&f.store, "p-6"), TransactionStatus::Paid);

        let messages = f.notifier.messages.lock().unwrap();
        assert!(messages[0].1.contains("not found"));
    }

    #[tokio::test]
    async fn provisioning_failure_keeps_the_capture() {
        let f = fixture(FakePanel::failing());
        f.store
            .create_transaction(&pending("p-7", 42, 30_000, new_key_action()))
            .await
            .unwrap();

        let outcome = f.engine.settle(&note("p-7", 30_000)).await.unwrap();
        assert_eq!(outcome, SettlementOutcome::Settled);
        assert_eq!(status_of(&f.store, "p-7"), TransactionStatus::Paid);
        assert!(f.store.recorded_keys.lock().unwrap().is_empty());

        let messages = f.notifier.messages.lock().unwrap();
        assert!(messages[0].1.contains("contact support"));
    }

    #[tokio::test]
    async fn promo_is_consumed_after_successful_key_action() {
        let f = fixture(FakePanel::succeeding(1));
        let mut txn = pending("p-8", 42, 30_000, new_key_action());
        txn.promo_code = Some("WELCOME".to_string());
        f.store.create_transaction(&txn).await.unwrap();

        f.engine.settle(&note("p-8", 30_000)).await.unwrap();
        assert_eq!(
            f.store.consumed_promos.lock().unwrap().as_slice(),
            &[("WELCOME".to_string(), 42)]
        );
    }

    #[tokio::test]
    async fn late_webhook_for_expired_transaction_is_rejected() {
        let f = fixture(FakePanel::succeeding(1));
        let mut txn = pending("p-9", 42, 30_000, new_key_action());
        txn.status = TransactionStatus::Expired;
        f.store
            .txns
            .lock()
            .unwrap()
            .insert(txn.payment_id.clone(), txn);

        let err = f.engine.settle(&note("p-9", 30_000)).await.unwrap_err();
        assert!(matches!(
            err,
            SettlementError::AlreadyTerminal {
                status: TransactionStatus::Expired,
                ..
            }
        ));
        assert_eq!(status_of(&f.store, "p-9"), TransactionStatus::Expired);
        assert_eq!(f.panel.call_count(), 0);
    }

    #[test]
    fn generated_key_identities_are_scoped_to_the_user() {
        let email = generate_key_email(42);
        assert!(email.starts_with("user_42_"));
        assert_eq!(email.len(), "user_42_".len() + 6);
        assert!(email
            .rsplit('_')
            .next()
            .unwrap()
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }
}
