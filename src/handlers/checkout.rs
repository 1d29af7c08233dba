use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppError;
use crate::validation::{validate_redirect_url, StrictPayload};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub buyer_id: Uuid,
    pub success_url: String,
    pub cancel_url: String,
}

pub async fn create_checkout(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<StrictPayload<CheckoutRequest>>,
) -> Result<impl IntoResponse, AppError> {
    let request = payload.data;
    validate_redirect_url("success_url", &request.success_url)?;
    validate_redirect_url("cancel_url", &request.cancel_url)?;

    let outcome = state
        .services
        .checkout
        .create_checkout_session(order_id, request.buyer_id, &request.success_url, &request.cancel_url)
        .await?;

    Ok((StatusCode::CREATED, Json(outcome)))
}
