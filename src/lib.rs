pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod handlers;
pub mod marketplace;
pub mod middleware;
pub mod provider;
pub mod services;
pub mod startup;
pub mod utils;
pub mod validation;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::config::Config;
use crate::middleware::auth::{admin_auth, AdminKey};
use crate::middleware::request_logger::{request_logger_middleware, RequestLogConfig};
use crate::services::SettlementServices;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: sqlx::PgPool,
    pub services: SettlementServices,
}

pub fn create_app(state: AppState) -> Router {
    let admin_key = AdminKey(Arc::new(state.config.admin_api_key.clone()));
    let log_config = RequestLogConfig {
        log_body: state.config.log_request_body,
    };

    let admin = Router::new()
        .route(
            "/admin/transactions/:id/release",
            post(handlers::admin::release_transaction),
        )
        .route(
            "/admin/transactions/:id/transfer",
            post(handlers::admin::transfer_transaction),
        )
        .route(
            "/admin/transactions/:id/refund",
            post(handlers::admin::refund_transaction),
        )
        .route("/admin/payouts/:id/reconcile", post(handlers::admin::reconcile_payout))
        .route("/admin/payouts/:id/retry", post(handlers::admin::retry_payout))
        .route("/admin/exchange-rates", post(handlers::admin::record_exchange_rate))
        .route_layer(from_fn_with_state(admin_key, admin_auth));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/webhooks/provider", post(handlers::webhook::provider_webhook))
        .route("/orders/:id/checkout", post(handlers::checkout::create_checkout))
        .route("/transactions/:id", get(handlers::transactions::get_transaction))
        .route("/sellers/:id/holds", get(handlers::transactions::seller_holds))
        .route("/sellers/:id/eligible", get(handlers::transactions::seller_eligible))
        .route(
            "/sellers/:id/payouts",
            get(handlers::payouts::list_seller_payouts).post(handlers::payouts::create_payout),
        )
        .route("/payouts/:id", get(handlers::payouts::get_payout))
        .merge(admin)
        .layer(from_fn_with_state(log_config, request_logger_middleware))
        .with_state(state)
}
