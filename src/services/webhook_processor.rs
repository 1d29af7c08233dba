//! Provider notification processing.
//!
//! Every delivery is verified before anything is persisted, latched through the
//! `webhook_events` table and dispatched to one handler that runs as a single
//! READ COMMITTED unit of work. Handlers lock the rows they change and are safe
//! to re-run: redelivery of a processed event never reaches them.

use chrono::{Duration, TimeZone, Utc};
use serde::Serialize;
use sqlx::PgConnection;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{queries, IsolationLevel, TransactionRunner, TxFailure};
use crate::domain::audit::WEBHOOK_ACTOR;
use crate::domain::money::FeeSchedule;
use crate::domain::{FailureInfo, PayoutStatus, Transaction, TransactionStatus, WebhookEventStatus};
use crate::error::SettlementError;
use crate::marketplace::{OrderDirectory, SellerDirectory, VerificationFlags};
use crate::provider::events::{CheckoutSessionObject, PayoutObject, RefundObject, TransferObject};
use crate::provider::{EventKind, PaymentProvider, ProviderEvent};
use crate::services::checkout::{insert_order_transactions, transactions_for_order};
use crate::services::events::{EventBus, SettlementEvent};
use crate::services::payouts::{apply_payout_status, PayoutStatusUpdate};

/// A `processing` claim older than this is treated as abandoned.
const STALE_CLAIM_MINUTES: i64 = 5;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "error", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Processed,
    /// Already processed by an earlier delivery.
    Duplicate,
    /// Event type this service does not act on.
    Ignored,
    /// Another delivery holds the claim right now.
    InFlight,
    Failed(String),
}

impl WebhookOutcome {
    pub fn handled(&self) -> bool {
        matches!(self, WebhookOutcome::Processed | WebhookOutcome::Duplicate)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookOutcome::Processed => "processed",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::Ignored => "ignored",
            WebhookOutcome::InFlight => "in_flight",
            WebhookOutcome::Failed(_) => "failed",
        }
    }
}

/// Checkout data gathered outside the unit of work.
#[derive(Debug, Clone)]
struct PreparedCheckout {
    order_id: Uuid,
    payment_reference: Option<String>,
    paid: bool,
    /// Rows to create when the checkout flow never recorded any.
    fallback: Vec<Transaction>,
}

#[derive(Clone)]
pub struct WebhookProcessor {
    runner: TransactionRunner,
    provider: Arc<dyn PaymentProvider>,
    orders: Arc<dyn OrderDirectory>,
    sellers: Arc<dyn SellerDirectory>,
    events: EventBus,
    fees: FeeSchedule,
    hold_days: i64,
}

impl WebhookProcessor {
    pub fn new(
        runner: TransactionRunner,
        provider: Arc<dyn PaymentProvider>,
        orders: Arc<dyn OrderDirectory>,
        sellers: Arc<dyn SellerDirectory>,
        events: EventBus,
        fees: FeeSchedule,
        hold_days: i64,
    ) -> Self {
        Self {
            runner,
            provider,
            orders,
            sellers,
            events,
            fees,
            hold_days,
        }
    }

    /// Verifies the signature and processes the event. Only a verification
    /// or decoding failure is an error; processing failures are reported in
    /// the outcome.
    pub async fn handle_raw(
        &self,
        payload: &[u8],
        signature_header: &str,
        client_id: Option<&str>,
    ) -> Result<WebhookOutcome, SettlementError> {
        let event = self.provider.verify_webhook(payload, signature_header)?;
        Ok(self.process(event, client_id).await)
    }

    pub async fn process(&self, event: ProviderEvent, client_id: Option<&str>) -> WebhookOutcome {
        let now = Utc::now();
        let claimed = match self.claim(&event, client_id).await {
            Ok(claimed) => claimed,
            Err(e) => {
                tracing::error!(event_id = %event.id, error = %e, "Failed to record webhook event");
                return WebhookOutcome::Failed(e.to_string());
            }
        };
        let webhook_id = match claimed {
            Some(id) => id,
            None => return self.unclaimed_outcome(&event.id).await,
        };

        if let EventKind::Unhandled { event_type } = &event.kind {
            tracing::info!(event_id = %event.id, %event_type, "Ignoring unhandled webhook event type");
            if let Err(e) = self.mark_ignored(webhook_id).await {
                tracing::warn!(event_id = %event.id, error = %e, "Failed to mark webhook event ignored");
            }
            return WebhookOutcome::Ignored;
        }

        let prepared = match self.prepare(&event.kind).await {
            Ok(prepared) => prepared,
            Err(e) => return self.fail(webhook_id, &event, e).await,
        };

        let kind = event.kind.clone();
        let hold_days = self.hold_days;
        let result = self
            .runner
            .run(IsolationLevel::ReadCommitted, move |conn| {
                Box::pin(handle_unit(conn, webhook_id, kind.clone(), prepared.clone(), hold_days))
            })
            .await;

        match result {
            Ok(events) => {
                self.events.publish_all(events);
                tracing::info!(
                    event_id = %event.id,
                    event_type = %event.event_type,
                    elapsed_ms = (Utc::now() - now).num_milliseconds(),
                    "Webhook event processed"
                );
                WebhookOutcome::Processed
            }
            Err(e) => self.fail(webhook_id, &event, e).await,
        }
    }

    async fn claim(&self, event: &ProviderEvent, client_id: Option<&str>) -> Result<Option<Uuid>, SettlementError> {
        let now = Utc::now();
        let mut conn = self.runner.pool().acquire().await?;
        let claimed = queries::claim_webhook_event(
            &mut conn,
            &event.id,
            &event.event_type,
            &event.raw,
            client_id,
            now,
            now - Duration::minutes(STALE_CLAIM_MINUTES),
        )
        .await?;
        Ok(claimed.map(|row| row.id))
    }

    async fn unclaimed_outcome(&self, external_event_id: &str) -> WebhookOutcome {
        let existing = match self.runner.pool().acquire().await {
            Ok(mut conn) => queries::get_webhook_event(&mut conn, external_event_id).await,
            Err(e) => Err(e.into()),
        };
        match existing {
            Ok(Some(row)) if row.status == WebhookEventStatus::Processed => {
                tracing::info!(event_id = external_event_id, "Duplicate webhook delivery skipped");
                WebhookOutcome::Duplicate
            }
            Ok(_) => {
                tracing::info!(event_id = external_event_id, "Webhook event is being processed by another delivery");
                WebhookOutcome::InFlight
            }
            Err(e) => WebhookOutcome::Failed(e.to_string()),
        }
    }

    async fn mark_ignored(&self, webhook_id: Uuid) -> Result<(), SettlementError> {
        let mut conn = self.runner.pool().acquire().await?;
        queries::mark_webhook_ignored(&mut conn, webhook_id, Utc::now()).await
    }

    async fn fail(&self, webhook_id: Uuid, event: &ProviderEvent, error: SettlementError) -> WebhookOutcome {
        tracing::error!(
            event_id = %event.id,
            event_type = %event.event_type,
            error = %error,
            "Webhook event processing failed"
        );
        let message = error.to_string();
        let marked = match self.runner.pool().acquire().await {
            Ok(mut conn) => queries::mark_webhook_failed(&mut conn, webhook_id, &message, Utc::now()).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = marked {
            tracing::error!(event_id = %event.id, error = %e, "Failed to mark webhook event failed");
        }
        WebhookOutcome::Failed(message)
    }

    /// External lookups a handler needs, done before any row is locked.
    async fn prepare(&self, kind: &EventKind) -> Result<Option<PreparedCheckout>, SettlementError> {
        match kind {
            EventKind::CheckoutCompleted(session) => self.prepare_checkout(session).await.map(Some),
            EventKind::AccountUpdated(account) => {
                let flags = VerificationFlags {
                    charges_enabled: account.charges_enabled,
                    payouts_enabled: account.payouts_enabled,
                    details_submitted: account.details_submitted,
                    requirements_due: account.requirements.currently_due.clone(),
                };
                self.sellers.update_verification(&account.id, &flags).await?;
                tracing::info!(
                    account_id = %account.id,
                    payouts_enabled = flags.payouts_enabled,
                    "Seller verification flags updated"
                );
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    async fn prepare_checkout(&self, session: &CheckoutSessionObject) -> Result<PreparedCheckout, SettlementError> {
        let order_id = session.order_id().ok_or_else(|| {
            SettlementError::InvalidPayload(format!("checkout session {} carries no order id", session.id))
        })?;

        let paid = if session.is_paid() {
            true
        } else if let Some(intent_id) = &session.payment_intent {
            let intent = self
                .provider
                .retrieve_payment_intent(intent_id)
                .await
                .map_err(SettlementError::from)?;
            intent.is_succeeded()
        } else {
            false
        };
        let payment_reference = session.payment_intent.clone().or_else(|| Some(session.id.clone()));

        let existing = {
            let mut conn = self.runner.pool().acquire().await?;
            queries::list_transactions_for_order(&mut conn, order_id).await?
        };
        let fallback = if existing.is_empty() && paid {
            let buyer_id = session.buyer_id().ok_or_else(|| {
                SettlementError::InvalidPayload(format!(
                    "checkout session {} has no buyer id to build transactions from",
                    session.id
                ))
            })?;
            let lines = self.orders.order_items(order_id).await?;
            tracing::info!(%order_id, lines = lines.len(), "No transactions recorded for order, splitting from line items");
            transactions_for_order(order_id, buyer_id, &lines, &self.fees, payment_reference.clone(), Utc::now())?
        } else {
            Vec::new()
        };

        Ok(PreparedCheckout {
            order_id,
            payment_reference,
            paid,
            fallback,
        })
    }
}

async fn handle_unit(
    conn: &mut PgConnection,
    webhook_id: Uuid,
    kind: EventKind,
    prepared: Option<PreparedCheckout>,
    hold_days: i64,
) -> Result<Vec<SettlementEvent>, TxFailure> {
    let events = match kind {
        EventKind::CheckoutCompleted(_) => match prepared {
            Some(checkout) => handle_checkout_completed(conn, checkout, hold_days).await?,
            None => Vec::new(),
        },
        EventKind::RefundUpdated(refund) => handle_refund_update(conn, &refund, false).await?,
        EventKind::RefundFailed(refund) => handle_refund_update(conn, &refund, true).await?,
        EventKind::TransferCreated(transfer) => handle_transfer_created(conn, &transfer).await?,
        EventKind::TransferFailed(transfer) => handle_transfer_failed(conn, &transfer).await?,
        // Verification flags were pushed to the seller directory beforehand.
        EventKind::AccountUpdated(_) => Vec::new(),
        EventKind::PayoutPaid(payout) => handle_payout(conn, &payout, Some(PayoutStatus::Paid)).await?,
        EventKind::PayoutFailed(payout) => handle_payout(conn, &payout, Some(PayoutStatus::Failed)).await?,
        EventKind::PayoutCanceled(payout) => {
            handle_payout(conn, &payout, Some(PayoutStatus::Canceled)).await?
        }
        EventKind::PayoutUpdated(payout) => handle_payout(conn, &payout, None).await?,
        EventKind::Unhandled { .. } => Vec::new(),
    };

    queries::mark_webhook_processed(conn, webhook_id, Utc::now()).await?;
    Ok(events)
}

async fn handle_checkout_completed(
    conn: &mut PgConnection,
    checkout: PreparedCheckout,
    hold_days: i64,
) -> Result<Vec<SettlementEvent>, TxFailure> {
    if !checkout.paid {
        tracing::info!(order_id = %checkout.order_id, "Checkout completed without captured payment");
        return Ok(Vec::new());
    }

    let transactions = insert_order_transactions(conn, checkout.order_id, &checkout.fallback).await?;
    if transactions.is_empty() {
        return Err(SettlementError::NotFound(format!("transactions for order {}", checkout.order_id)).into());
    }

    let now = Utc::now();
    let mut events = Vec::new();
    for mut tx in transactions {
        if tx.status() != TransactionStatus::Pending {
            tracing::debug!(transaction_id = %tx.id, status = %tx.status(), "Transaction already past checkout");
            continue;
        }
        tx.mark_held(checkout.payment_reference.clone(), hold_days, now)?;
        queries::save_transaction(conn, &tx).await?;
        tracing::info!(
            transaction_id = %tx.id,
            order_id = %tx.order_id,
            net_amount = %tx.net_amount(),
            planned_release_at = ?tx.planned_release_at,
            "Payment captured, funds held"
        );
        events.extend(SettlementEvent::for_transaction(&tx, TransactionStatus::Pending));
    }
    Ok(events)
}

async fn lock_refund_target(conn: &mut PgConnection, refund: &RefundObject) -> Result<Transaction, TxFailure> {
    let found = match refund.transaction_id() {
        Some(id) => queries::lock_transaction(conn, id).await?,
        None => queries::lock_transaction_by_refund_reference(conn, &refund.id).await?,
    };
    found.ok_or_else(|| SettlementError::NotFound(format!("transaction for refund {}", refund.id)).into())
}

async fn handle_refund_update(
    conn: &mut PgConnection,
    refund: &RefundObject,
    failed_event: bool,
) -> Result<Vec<SettlementEvent>, TxFailure> {
    let mut tx = lock_refund_target(conn, refund).await?;
    let from = tx.status();
    let now = Utc::now();

    let failed = failed_event || matches!(refund.status.as_str(), "failed" | "canceled");
    let succeeded = !failed && refund.status == "succeeded";
    if !failed && !succeeded {
        tracing::debug!(transaction_id = %tx.id, refund_status = %refund.status, "Refund still pending");
        return Ok(Vec::new());
    }
    if matches!(from, TransactionStatus::Refunded | TransactionStatus::FailedRefund) {
        tracing::debug!(transaction_id = %tx.id, status = %from, "Refund outcome already recorded");
        return Ok(Vec::new());
    }

    if succeeded {
        tx.complete_refund(Some(refund.id.clone()), now)?;
        tracing::info!(transaction_id = %tx.id, refund_id = %refund.id, amount = %refund.amount(), "Refund succeeded");
    } else {
        let reason = refund
            .failure_reason
            .clone()
            .unwrap_or_else(|| refund.status.clone());
        tx.fail_refund(&reason, now)?;
        tracing::warn!(transaction_id = %tx.id, refund_id = %refund.id, %reason, "Refund failed, manual review required");
    }
    queries::save_transaction(conn, &tx).await?;
    Ok(SettlementEvent::for_transaction(&tx, from).into_iter().collect())
}

async fn lock_transfer_target(conn: &mut PgConnection, transfer: &TransferObject) -> Result<Transaction, TxFailure> {
    let found = match transfer.transaction_id() {
        Some(id) => queries::lock_transaction(conn, id).await?,
        None => queries::lock_transaction_by_transfer_reference(conn, &transfer.id).await?,
    };
    found.ok_or_else(|| SettlementError::NotFound(format!("transaction for transfer {}", transfer.id)).into())
}

async fn handle_transfer_created(
    conn: &mut PgConnection,
    transfer: &TransferObject,
) -> Result<Vec<SettlementEvent>, TxFailure> {
    let mut tx = lock_transfer_target(conn, transfer).await?;
    let from = tx.status();
    if from == TransactionStatus::Released {
        tracing::debug!(transaction_id = %tx.id, "Transfer already confirmed");
        return Ok(Vec::new());
    }

    let now = Utc::now();
    tx.complete_transfer(&transfer.id, now)?;
    queries::save_transaction(conn, &tx).await?;
    let paid_items = queries::mark_payout_items_paid(conn, tx.id, now).await?;
    tracing::info!(
        transaction_id = %tx.id,
        transfer_id = %transfer.id,
        paid_items,
        "Transfer confirmed, funds released"
    );
    Ok(SettlementEvent::for_transaction(&tx, from).into_iter().collect())
}

async fn handle_transfer_failed(
    conn: &mut PgConnection,
    transfer: &TransferObject,
) -> Result<Vec<SettlementEvent>, TxFailure> {
    let mut tx = lock_transfer_target(conn, transfer).await?;
    let from = tx.status();
    let now = Utc::now();

    match from {
        TransactionStatus::Held => {
            tracing::debug!(transaction_id = %tx.id, "Transfer failure already rolled back");
            return Ok(Vec::new());
        }
        TransactionStatus::Released => {
            tx.append_note(
                WEBHOOK_ACTOR,
                format!("transfer {} reported failed after release", transfer.id),
                now,
            );
            queries::save_transaction(conn, &tx).await?;
            tracing::warn!(transaction_id = %tx.id, transfer_id = %transfer.id, "Transfer failure after release needs review");
            return Ok(Vec::new());
        }
        _ => {}
    }

    tx.rollback_transfer("provider reported transfer failure", WEBHOOK_ACTOR, true, now)?;
    if tx.payout_claimed() {
        let voided = queries::void_payout_items(conn, tx.id).await?;
        tx.release_payout_claim(WEBHOOK_ACTOR, &format!("transfer {} failed", transfer.id), now);
        tracing::info!(transaction_id = %tx.id, voided, "Payout items voided after transfer failure");
    }
    queries::save_transaction(conn, &tx).await?;
    tracing::warn!(
        transaction_id = %tx.id,
        transfer_id = %transfer.id,
        retry_count = tx.transfer_retry_count,
        "Transfer failed, transaction back on hold"
    );
    Ok(SettlementEvent::for_transaction(&tx, from).into_iter().collect())
}

async fn handle_payout(
    conn: &mut PgConnection,
    object: &PayoutObject,
    status: Option<PayoutStatus>,
) -> Result<Vec<SettlementEvent>, TxFailure> {
    let status = match status {
        Some(status) => status,
        None => PayoutStatus::from_str(&object.status)?,
    };
    let payout_id = match object.payout_id() {
        Some(id) => Some(id),
        None => queries::find_payout_id_by_provider_id(conn, &object.id).await?,
    };
    let payout_id = payout_id
        .ok_or_else(|| SettlementError::NotFound(format!("payout for provider payout {}", object.id)))?;

    let failure = (status == PayoutStatus::Failed).then(|| FailureInfo {
        code: object.failure_code.clone(),
        message: object.failure_message.clone(),
    });
    let update = PayoutStatusUpdate {
        status,
        failure,
        reported_amount: (status == PayoutStatus::Paid).then(|| object.amount()),
        arrival_date: object
            .arrival_date
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
        note: Some(format!("provider payout {} reported {}", object.id, object.status)),
        actor: WEBHOOK_ACTOR.to_string(),
    };
    let (_, events) = apply_payout_status(conn, payout_id, &update).await?;
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_processed_and_duplicate_count_as_handled() {
        assert!(WebhookOutcome::Processed.handled());
        assert!(WebhookOutcome::Duplicate.handled());
        assert!(!WebhookOutcome::Ignored.handled());
        assert!(!WebhookOutcome::InFlight.handled());
        assert!(!WebhookOutcome::Failed("boom".to_string()).handled());
    }

    #[test]
    fn outcome_serializes_with_tag() {
        let json = serde_json::to_value(WebhookOutcome::Failed("boom".to_string())).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["error"], "boom");
        assert_eq!(WebhookOutcome::InFlight.as_str(), "in_flight");
    }
}
