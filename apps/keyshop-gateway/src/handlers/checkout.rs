use crate::services::checkout::{CheckoutError, CheckoutRedirect};
use crate::AppState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use keyshop_db::models::transaction::PaymentProvider;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Deserialize)]
pub struct PurchaseRequest {
    pub user_id: i64,
    pub plan_id: i64,
    /// Present for renewals, absent for new keys.
    pub key_id: Option<i64>,
    pub provider: PaymentProvider,
    pub promo_code: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TopUpRequest {
    pub user_id: i64,
    /// Kopeks.
    pub amount: i64,
    pub provider: PaymentProvider,
}

#[derive(Debug, Deserialize)]
pub struct BalancePurchaseRequest {
    pub user_id: i64,
    pub plan_id: i64,
    pub key_id: Option<i64>,
    pub promo_code: Option<String>,
}

#[derive(Debug, Serialize)]
struct CheckoutResponse {
    payment_id: String,
    url: String,
    amount: i64,
}

pub async fn begin_purchase(
    State(state): State<AppState>,
    Json(req): Json<PurchaseRequest>,
) -> Response {
    let result = state
        .checkout
        .begin_purchase(req.user_id, req.plan_id, req.key_id, req.provider, req.promo_code)
        .await;
    redirect_response(result)
}

pub async fn begin_top_up(
    State(state): State<AppState>,
    Json(req): Json<TopUpRequest>,
) -> Response {
    let result = state
        .checkout
        .begin_top_up(req.user_id, req.amount, req.provider)
        .await;
    redirect_response(result)
}

pub async fn pay_with_balance(
    State(state): State<AppState>,
    Json(req): Json<BalancePurchaseRequest>,
) -> Response {
    match state
        .checkout
        .pay_with_balance(req.user_id, req.plan_id, req.key_id, req.promo_code)
        .await
    {
        Ok(_) => Json(json!({ "status": "paid" })).into_response(),
        Err(e) => error_response(e),
    }
}

fn redirect_response(result: Result<CheckoutRedirect, CheckoutError>) -> Response {
    match result {
        Ok(redirect) => Json(CheckoutResponse {
            payment_id: redirect.payment_id,
            url: redirect.url,
            amount: redirect.amount,
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}

fn error_response(err: CheckoutError) -> Response {
    let status = match &err {
        CheckoutError::ProviderUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        CheckoutError::PlanNotFound(_) | CheckoutError::KeyNotFound(_) => StatusCode::NOT_FOUND,
        CheckoutError::PromoInvalid | CheckoutError::InvalidAmount => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        CheckoutError::InsufficientBalance => StatusCode::PAYMENT_REQUIRED,
        CheckoutError::Internal(e) => {
            tracing::error!("checkout failed: {e:#}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
                .into_response();
        }
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}
