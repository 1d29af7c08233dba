use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::domain::Payout;
use crate::error::AppError;
use crate::AppState;

#[derive(Debug, Serialize)]
pub struct CreatedPayouts {
    pub seller_id: Uuid,
    pub payouts: Vec<Payout>,
}

/// Batches every eligible transaction of the seller. 201 when at least one
/// payout was created, 200 with an empty list otherwise.
pub async fn create_payout(
    State(state): State<AppState>,
    Path(seller_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let payouts = state.services.payouts.create_payout(seller_id).await?;
    let status = if payouts.is_empty() {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(CreatedPayouts { seller_id, payouts })))
}

pub async fn get_payout(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let details = state.services.payouts.get_payout(id).await?;
    Ok(Json(details))
}

pub async fn list_seller_payouts(
    State(state): State<AppState>,
    Path(seller_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let payouts = state.services.payouts.list_payouts(seller_id).await?;
    Ok(Json(payouts))
}
