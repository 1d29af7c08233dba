//! Row types for SQLx. They stay inside `db`; callers get domain types.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::domain::{
    AuditNote, ExchangeRateSnapshot, Payout, PayoutItem, SettlementAmounts, StatusChange,
    Transaction, WebhookEvent,
};
use crate::error::SettlementError;

#[derive(Debug, FromRow)]
pub(super) struct TransactionRow {
    id: Uuid,
    order_id: Uuid,
    seller_id: Uuid,
    buyer_id: Uuid,
    payment_reference: Option<String>,
    transfer_reference: Option<String>,
    refund_reference: Option<String>,
    gross_amount: BigDecimal,
    platform_fee: BigDecimal,
    provider_fee: BigDecimal,
    refund_amount: Option<BigDecimal>,
    currency: String,
    status: String,
    hold_reason: Option<String>,
    payment_received_at: Option<DateTime<Utc>>,
    hold_started_at: Option<DateTime<Utc>>,
    planned_release_at: Option<DateTime<Utc>>,
    actual_release_at: Option<DateTime<Utc>>,
    payout_claimed: bool,
    transfer_retry_count: i32,
    status_changed_at: DateTime<Utc>,
    notes: Json<Vec<AuditNote>>,
    metadata: serde_json::Value,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TransactionRow {
    pub(super) fn into_domain(self) -> Result<Transaction, SettlementError> {
        Ok(Transaction {
            id: self.id,
            order_id: self.order_id,
            seller_id: self.seller_id,
            buyer_id: self.buyer_id,
            payment_reference: self.payment_reference,
            transfer_reference: self.transfer_reference,
            refund_reference: self.refund_reference,
            amounts: SettlementAmounts::new(self.gross_amount, self.platform_fee, self.provider_fee)?,
            refund_amount: self.refund_amount,
            currency: self.currency,
            status: self.status.parse()?,
            hold_reason: self.hold_reason,
            payment_received_at: self.payment_received_at,
            hold_started_at: self.hold_started_at,
            planned_release_at: self.planned_release_at,
            actual_release_at: self.actual_release_at,
            payout_claimed: self.payout_claimed,
            transfer_retry_count: self.transfer_retry_count,
            status_changed_at: self.status_changed_at,
            notes: self.notes.0,
            metadata: self.metadata,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct PayoutRow {
    id: Uuid,
    seller_id: Uuid,
    provider_payout_id: Option<String>,
    destination_account: String,
    idempotency_key: String,
    total_amount: BigDecimal,
    currency: String,
    fee_total: BigDecimal,
    status: String,
    failure_code: Option<String>,
    failure_message: Option<String>,
    arrival_date: Option<DateTime<Utc>>,
    reconciliation_status: String,
    retry_count: i32,
    status_history: Json<Vec<StatusChange>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PayoutRow {
    pub(super) fn into_domain(self) -> Result<Payout, SettlementError> {
        Ok(Payout {
            id: self.id,
            seller_id: self.seller_id,
            provider_payout_id: self.provider_payout_id,
            destination_account: self.destination_account,
            idempotency_key: self.idempotency_key,
            total_amount: self.total_amount,
            currency: self.currency,
            fee_total: self.fee_total,
            status: self.status.parse()?,
            failure_code: self.failure_code,
            failure_message: self.failure_message,
            arrival_date: self.arrival_date,
            reconciliation_status: self.reconciliation_status.parse()?,
            retry_count: self.retry_count,
            status_history: self.status_history.0,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct PayoutItemRow {
    id: Uuid,
    payout_id: Uuid,
    transaction_id: Uuid,
    order_id: Uuid,
    amount: BigDecimal,
    currency: String,
    status: String,
    paid_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl PayoutItemRow {
    pub(super) fn into_domain(self) -> Result<PayoutItem, SettlementError> {
        Ok(PayoutItem {
            id: self.id,
            payout_id: self.payout_id,
            transaction_id: self.transaction_id,
            order_id: self.order_id,
            amount: self.amount,
            currency: self.currency,
            status: self.status.parse()?,
            paid_at: self.paid_at,
            created_at: self.created_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct WebhookEventRow {
    id: Uuid,
    external_event_id: String,
    event_type: String,
    payload: serde_json::Value,
    status: String,
    attempts: i32,
    last_error: Option<String>,
    client_id: Option<String>,
    received_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
}

impl WebhookEventRow {
    pub(super) fn into_domain(self) -> Result<WebhookEvent, SettlementError> {
        Ok(WebhookEvent {
            id: self.id,
            external_event_id: self.external_event_id,
            event_type: self.event_type,
            payload: self.payload,
            status: self.status.parse()?,
            attempts: self.attempts,
            last_error: self.last_error,
            client_id: self.client_id,
            received_at: self.received_at,
            processed_at: self.processed_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(Debug, FromRow)]
pub(super) struct ExchangeRateRow {
    id: Uuid,
    base_currency: String,
    target_currency: String,
    rate: BigDecimal,
    captured_at: DateTime<Utc>,
    source: String,
}

impl ExchangeRateRow {
    pub(super) fn into_domain(self) -> ExchangeRateSnapshot {
        ExchangeRateSnapshot {
            id: self.id,
            base_currency: self.base_currency,
            target_currency: self.target_currency,
            rate: self.rate,
            captured_at: self.captured_at,
            source: self.source,
        }
    }
}
