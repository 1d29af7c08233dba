//! Operator endpoints. Every route sits behind the admin bearer key and
//! records the acting operator in the audit trail it touches.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use bigdecimal::BigDecimal;
use serde::Deserialize;
use std::str::FromStr;
use uuid::Uuid;

use crate::domain::{PayoutStatus, ReconciliationStatus};
use crate::error::AppError;
use crate::validation::{
    sanitize_string, validate_actor, validate_currency_code, validate_max_len, validate_note,
    validate_positive_amount, validate_required, StrictPayload, SOURCE_MAX_LEN,
};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct ReleaseRequest {
    pub performed_by: String,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub performed_by: String,
    /// Lifts the hold-expiry and retry-ceiling guards.
    #[serde(default)]
    pub admin_override: bool,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub performed_by: String,
    pub reason: String,
    pub amount: Option<BigDecimal>,
}

#[derive(Debug, Deserialize)]
pub struct ReconcileRequest {
    pub performed_by: String,
    pub reconciliation_status: String,
    pub status: Option<PayoutStatus>,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RetryRequest {
    pub performed_by: String,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeRateRequest {
    pub base_currency: String,
    pub target_currency: String,
    pub rate: BigDecimal,
    pub source: String,
}

pub async fn release_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<StrictPayload<ReleaseRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let request = payload.data;
    let actor = validate_actor(&request.performed_by)?;
    let notes = validate_note(request.notes.as_deref())?;

    let tx = state.services.holds.manual_release(id, &actor, notes).await?;
    Ok(Json(tx))
}

pub async fn transfer_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<StrictPayload<TransferRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let request = payload.data;
    let actor = validate_actor(&request.performed_by)?;
    let notes = validate_note(request.notes.as_deref())?;

    let tx = state
        .services
        .transfers
        .initiate_transfer(id, request.admin_override, &actor, notes)
        .await?;
    Ok(Json(tx))
}

pub async fn refund_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<StrictPayload<RefundRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let request = payload.data;
    let actor = validate_actor(&request.performed_by)?;
    let reason = validate_note(Some(&request.reason))?
        .ok_or_else(|| AppError::Validation("reason: must not be empty".to_string()))?;
    if let Some(amount) = &request.amount {
        validate_positive_amount("amount", amount)?;
    }

    let tx = state
        .services
        .transfers
        .request_refund(id, request.amount, &reason, &actor)
        .await?;
    Ok(Json(tx))
}

pub async fn reconcile_payout(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<StrictPayload<ReconcileRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let request = payload.data;
    let actor = validate_actor(&request.performed_by)?;
    let notes = validate_note(request.notes.as_deref())?;
    let reconciliation = ReconciliationStatus::from_str(request.reconciliation_status.trim())?;

    let payout = state
        .services
        .payouts
        .reconcile_payout(id, reconciliation, request.status, notes, &actor)
        .await?;
    Ok(Json(payout))
}

pub async fn retry_payout(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<StrictPayload<RetryRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let actor = validate_actor(&payload.data.performed_by)?;
    let outcome = state.services.payouts.force_retry_payout(id, &actor).await?;
    Ok(Json(outcome))
}

pub async fn record_exchange_rate(
    State(state): State<AppState>,
    Json(payload): Json<StrictPayload<ExchangeRateRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let request = payload.data;
    let base = validate_currency_code("base_currency", &request.base_currency)?;
    let target = validate_currency_code("target_currency", &request.target_currency)?;
    validate_positive_amount("rate", &request.rate)?;
    let source = sanitize_string(&request.source);
    validate_required("source", &source)?;
    validate_max_len("source", &source, SOURCE_MAX_LEN)?;

    let snapshot = state
        .services
        .payouts
        .record_exchange_rate(&base, &target, request.rate, &source)
        .await?;
    Ok((StatusCode::CREATED, Json(snapshot)))
}
