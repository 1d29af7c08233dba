use axum::{
    body::Bytes,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    Json,
};
use serde::Serialize;

use crate::error::AppError;
use crate::services::WebhookOutcome;
use crate::AppState;

pub const SIGNATURE_HEADER: &str = "Stripe-Signature";
pub const CLIENT_ID_HEADER: &str = "X-Client-Id";

#[derive(Debug, Serialize)]
pub struct WebhookAck {
    pub received: bool,
    pub handled: bool,
    #[serde(flatten)]
    pub outcome: WebhookOutcome,
}

/// Provider notifications. Anything past signature verification is
/// acknowledged with 200 so the provider does not redeliver a poisoned event
/// forever; failures are recorded on the webhook row.
pub async fn provider_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, AppError> {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("missing {} header", SIGNATURE_HEADER)))?;
    let client_id = headers.get(CLIENT_ID_HEADER).and_then(|h| h.to_str().ok());

    let outcome = state
        .services
        .webhooks
        .handle_raw(&body, signature, client_id)
        .await
        .map_err(|err| {
            tracing::warn!(error = %err, "Rejected provider webhook");
            AppError::from(err)
        })?;

    if let WebhookOutcome::Failed(reason) = &outcome {
        tracing::error!(error = %reason, "Provider webhook processing failed");
    }

    Ok(Json(WebhookAck {
        received: true,
        handled: outcome.handled(),
        outcome,
    }))
}
