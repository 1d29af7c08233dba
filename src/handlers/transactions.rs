use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use uuid::Uuid;

use crate::error::AppError;
use crate::AppState;

pub async fn get_transaction(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let tx = state.services.get_transaction(id).await?;
    Ok(Json(tx))
}

/// Held transactions of a seller with their release progress.
pub async fn seller_holds(
    State(state): State<AppState>,
    Path(seller_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let summary = state.services.holds.get_seller_hold_summary(seller_id).await?;
    Ok(Json(summary))
}

pub async fn seller_eligible(
    State(state): State<AppState>,
    Path(seller_id): Path<Uuid>,
) -> Result<impl IntoResponse, AppError> {
    let eligible = state
        .services
        .payouts
        .select_eligible_transactions(seller_id)
        .await?;
    Ok(Json(eligible))
}
