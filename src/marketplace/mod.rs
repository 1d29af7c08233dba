//! Order and seller collaborators owned by the marketplace.
//!
//! Settlement only reads what it needs from them (delivery state, order
//! lines, totals due, payout destinations) and pushes status notifications.

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::money::OrderLine;
use crate::domain::TransactionStatus;
use crate::error::SettlementError;

pub mod client;

pub use client::MarketplaceClient;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmountDue {
    pub amount: BigDecimal,
    pub currency: String,
}

/// Verification flags mirrored from the provider's connected account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationFlags {
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub details_submitted: bool,
    pub requirements_due: Vec<String>,
}

#[async_trait]
pub trait OrderDirectory: Send + Sync {
    async fn is_delivered(&self, order_id: Uuid) -> Result<bool, SettlementError>;

    async fn order_items(&self, order_id: Uuid) -> Result<Vec<OrderLine>, SettlementError>;

    async fn amount_due(&self, order_id: Uuid) -> Result<AmountDue, SettlementError>;

    async fn notify_settlement_status(
        &self,
        order_id: Uuid,
        seller_id: Uuid,
        status: TransactionStatus,
    ) -> Result<(), SettlementError>;
}

#[async_trait]
pub trait SellerDirectory: Send + Sync {
    /// The provider account payouts for this seller go to, if onboarded.
    async fn payout_destination(&self, seller_id: Uuid) -> Result<Option<String>, SettlementError>;

    async fn update_verification(
        &self,
        account_id: &str,
        flags: &VerificationFlags,
    ) -> Result<(), SettlementError>;

    async fn seller_for_account(&self, account_id: &str) -> Result<Option<Uuid>, SettlementError>;
}
