use crate::services::payment::{load_adapter, AdapterError};
use crate::services::settlement::SettlementError;
use crate::AppState;
use axum::extract::{Form, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use keyshop_db::models::transaction::PaymentProvider;
use std::collections::HashMap;

pub async fn health() -> &'static str {
    "ok"
}

pub async fn yoomoney_webhook(
    State(state): State<AppState>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    handle_callback(&state, PaymentProvider::YooMoney, &params).await
}

/// Unitpay delivers GET requests and probes with `method=check` before
/// committing the payment; only `method=pay` settles.
pub async fn unitpay_webhook(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let method = params.get("method").map(String::as_str).unwrap_or("pay");
    if method == "pay" {
        return handle_callback(&state, PaymentProvider::Unitpay, &params).await;
    }

    let Some(adapter) = load_or_fail(&state, PaymentProvider::Unitpay).await else {
        return failure(StatusCode::SERVICE_UNAVAILABLE);
    };
    let note = match adapter.parse_callback(&params) {
        Ok(note) => note,
        Err(e) => return reject_callback(PaymentProvider::Unitpay, e),
    };
    match state.transactions.get_by_payment_id(&note.payment_id).await {
        Ok(Some(_)) => (StatusCode::OK, adapter.ack()).into_response(),
        Ok(None) => {
            tracing::warn!(payment_id = %note.payment_id, "unitpay check for unknown order");
            failure(StatusCode::NOT_FOUND)
        }
        Err(e) => {
            tracing::error!("unitpay check lookup failed: {e:#}");
            failure(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

pub async fn freekassa_webhook(
    State(state): State<AppState>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    handle_callback(&state, PaymentProvider::Freekassa, &params).await
}

pub async fn enot_webhook(
    State(state): State<AppState>,
    Form(params): Form<HashMap<String, String>>,
) -> Response {
    handle_callback(&state, PaymentProvider::Enot, &params).await
}

async fn handle_callback(
    state: &AppState,
    provider: PaymentProvider,
    params: &HashMap<String, String>,
) -> Response {
    let Some(adapter) = load_or_fail(state, provider).await else {
        return failure(StatusCode::SERVICE_UNAVAILABLE);
    };

    let note = match adapter.parse_callback(params) {
        Ok(note) => note,
        Err(e) => return reject_callback(provider, e),
    };

    match state.engine.settle(&note).await {
        // Duplicates are acknowledged too, so the provider stops retrying.
        Ok(_) => (StatusCode::OK, adapter.ack()).into_response(),
        Err(SettlementError::TransactionNotFound(id)) => {
            tracing::warn!(?provider, payment_id = %id, "callback for unknown transaction");
            failure(StatusCode::NOT_FOUND)
        }
        Err(e @ SettlementError::AmountMismatch { .. }) => {
            tracing::warn!(?provider, "rejected callback: {e}");
            failure(StatusCode::BAD_REQUEST)
        }
        Err(e @ SettlementError::AlreadyTerminal { .. }) => {
            tracing::warn!(?provider, "rejected callback: {e}");
            failure(StatusCode::CONFLICT)
        }
        Err(e) => {
            // One bad notification must not take the listener down; the
            // provider will retry against a non-2xx.
            tracing::error!(?provider, "settlement failed: {e:#}");
            failure(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

async fn load_or_fail(
    state: &AppState,
    provider: PaymentProvider,
) -> Option<Box<dyn crate::services::payment::PaymentAdapter>> {
    match load_adapter(provider, &state.settings).await {
        Ok(Some(adapter)) => Some(adapter),
        Ok(None) => {
            tracing::warn!(?provider, "callback for an unconfigured provider");
            None
        }
        Err(e) => {
            tracing::error!(?provider, "failed to load provider credentials: {e:#}");
            None
        }
    }
}

fn reject_callback(provider: PaymentProvider, err: AdapterError) -> Response {
    match err {
        AdapterError::BadSignature => {
            tracing::warn!(?provider, "rejected callback with invalid signature");
        }
        ref e => {
            tracing::warn!(?provider, "rejected callback: {e}");
        }
    }
    failure(StatusCode::BAD_REQUEST)
}

fn failure(status: StatusCode) -> Response {
    (status, "ERR").into_response()
}
