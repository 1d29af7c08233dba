//! Settlement domain: entities, state machines and money rules. No I/O here.

pub mod audit;
pub mod exchange_rate;
pub mod money;
pub mod payout;
pub mod transaction;
pub mod webhook_event;

pub use audit::{AuditNote, StatusChange};
pub use exchange_rate::ExchangeRateSnapshot;
pub use payout::{
    FailureInfo, Payout, PayoutItem, PayoutItemStatus, PayoutStatus, PayoutTransition,
    ReconciliationStatus,
};
pub use transaction::{
    NewTransaction, SettlementAmounts, Transaction, TransactionStatus, TransferContext,
};
pub use webhook_event::{WebhookEvent, WebhookEventStatus};
