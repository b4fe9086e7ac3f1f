use axum::routing::{get, post};
use axum::Router;
use keyshop_db::repositories::{SettingsRepository, TransactionRepository};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod handlers;
mod notify;
mod panel;
mod services;

use config::GatewayConfig;
use notify::{LogNotifier, Notifier, TelegramNotifier};
use panel::XuiClient;
use services::checkout::CheckoutService;
use services::settlement::{PgSettlementStore, SettlementEngine};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SettlementEngine>,
    pub checkout: Arc<CheckoutService>,
    pub settings: SettingsRepository,
    pub transactions: TransactionRepository,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "keyshop_gateway=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::load()?;
    let pool = keyshop_db::connect(&config.database_url).await?;
    tracing::info!("Database ready");

    let notifier: Arc<dyn Notifier> = match &config.bot_token {
        Some(token) => Arc::new(TelegramNotifier::new(token)),
        None => {
            tracing::warn!("BOT_TOKEN is not set; settlement outcomes will only be logged");
            Arc::new(LogNotifier)
        }
    };

    let panel = Arc::new(XuiClient::new(Duration::from_secs(config.panel_timeout_secs))?);
    let store = Arc::new(PgSettlementStore::new(pool.clone()));
    let engine = Arc::new(SettlementEngine::new(store, panel, notifier));
    let checkout = Arc::new(CheckoutService::new(pool.clone(), engine.clone()));

    let state = AppState {
        engine,
        checkout,
        settings: SettingsRepository::new(pool.clone()),
        transactions: TransactionRepository::new(pool),
    };

    spawn_expiry_sweeper(state.transactions.clone());

    let app = Router::new()
        .route("/health", get(handlers::payments::health))
        .route("/payments/yoomoney", post(handlers::payments::yoomoney_webhook))
        .route("/payments/unitpay", get(handlers::payments::unitpay_webhook))
        .route("/payments/freekassa", post(handlers::payments::freekassa_webhook))
        .route("/payments/enot", post(handlers::payments::enot_webhook))
        .route("/api/checkout/purchase", post(handlers::checkout::begin_purchase))
        .route("/api/checkout/topup", post(handlers::checkout::begin_top_up))
        .route("/api/checkout/balance", post(handlers::checkout::pay_with_balance))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.listen_port));
    tracing::info!("Gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Stale pending rows become `expired` so a forgotten payment page cannot be
/// settled weeks later. Rows are kept as audit records.
fn spawn_expiry_sweeper(transactions: TransactionRepository) {
    const SWEEP_INTERVAL: Duration = Duration::from_secs(3600);
    const MAX_PENDING_AGE_HOURS: i64 = 24;

    tokio::spawn(async move {
        let mut tick = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tick.tick().await;
            let cutoff = chrono::Utc::now() - chrono::Duration::hours(MAX_PENDING_AGE_HOURS);
            match transactions.expire_stale(cutoff).await {
                Ok(0) => {}
                Ok(n) => tracing::info!(expired = n, "swept stale pending transactions"),
                Err(e) => tracing::warn!("expiry sweep failed: {e:#}"),
            }
        }
    });
}
