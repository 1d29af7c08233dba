//! Payment provider gateway.
//!
//! Services depend on the [`PaymentProvider`] trait; the binary injects a
//! [`StripeClient`], tests inject in-memory fakes.

use async_trait::async_trait;
use thiserror::Error;

use crate::error::SettlementError;

pub mod client;
pub mod events;
pub mod signature;
pub mod types;

pub use client::StripeClient;
pub use events::{decode_event, EventKind, ProviderEvent};
pub use signature::WebhookVerifier;
pub use types::*;

/// The provider's own error set, translated into [`SettlementError`] at the
/// service boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ProviderError {
    /// Failures that say something about provider health rather than about
    /// the request.
    pub fn is_transient(&self) -> bool {
        matches!(self, ProviderError::ConnectionError(_))
    }
}

impl From<ProviderError> for SettlementError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::ConnectionError(msg) => SettlementError::ProviderConnection(msg),
            ProviderError::InvalidRequest(msg) => SettlementError::ProviderInvalidRequest(msg),
        }
    }
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ProviderError>;

    async fn create_transfer(&self, request: &TransferRequest) -> Result<Transfer, ProviderError>;

    async fn create_refund(&self, request: &RefundRequest) -> Result<Refund, ProviderError>;

    async fn create_payout(&self, request: &PayoutRequest) -> Result<ProviderPayout, ProviderError>;

    /// Available balance per currency for a connected account.
    async fn retrieve_balance(&self, account: &str) -> Result<Vec<BalanceAmount>, ProviderError>;

    async fn retrieve_account(&self, account: &str) -> Result<ProviderAccount, ProviderError>;

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, ProviderError>;

    /// Verifies the signature header against the raw body and decodes it.
    fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<ProviderEvent, SettlementError>;
}
