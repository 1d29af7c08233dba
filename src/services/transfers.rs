//! Transfer and refund initiation.
//!
//! Each operation is split into short units of work around the provider call
//! so no row lock is held while waiting on the network: lock and transition,
//! call the provider, then lock again to record the outcome.

use bigdecimal::BigDecimal;
use chrono::Utc;
use sqlx::PgConnection;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{queries, IsolationLevel, TransactionRunner, TxFailure};
use crate::domain::audit::SYSTEM_ACTOR;
use crate::domain::{Transaction, TransactionStatus, TransferContext};
use crate::error::SettlementError;
use crate::marketplace::{OrderDirectory, SellerDirectory};
use crate::provider::{PaymentProvider, RefundRequest, TransferRequest};
use crate::services::events::{EventBus, SettlementEvent};

type Changed = (Transaction, Vec<SettlementEvent>);

pub(crate) async fn load_transaction(
    runner: &TransactionRunner,
    id: Uuid,
) -> Result<Transaction, SettlementError> {
    let mut conn = runner.pool().acquire().await?;
    queries::get_transaction(&mut conn, id)
        .await?
        .ok_or_else(|| SettlementError::NotFound(format!("transaction {}", id)))
}

pub(crate) async fn lock_existing(conn: &mut PgConnection, id: Uuid) -> Result<Transaction, TxFailure> {
    match queries::lock_transaction(conn, id).await? {
        Some(tx) => Ok(tx),
        None => Err(SettlementError::NotFound(format!("transaction {}", id)).into()),
    }
}

fn changed(tx: Transaction, from: TransactionStatus) -> Changed {
    let events = SettlementEvent::for_transaction(&tx, from).into_iter().collect();
    (tx, events)
}

async fn begin_transfer_unit(
    conn: &mut PgConnection,
    id: Uuid,
    ctx: TransferContext,
    actor: String,
    note: Option<String>,
) -> Result<Changed, TxFailure> {
    let now = Utc::now();
    let mut tx = lock_existing(conn, id).await?;
    let from = tx.status();
    tx.begin_transfer(&ctx, &actor, now)?;
    if let Some(note) = note {
        tx.append_note(&actor, note, now);
    }
    queries::save_transaction(conn, &tx).await?;
    Ok(changed(tx, from))
}

async fn record_transfer_unit(
    conn: &mut PgConnection,
    id: Uuid,
    reference: String,
) -> Result<Transaction, TxFailure> {
    let mut tx = lock_existing(conn, id).await?;
    // The transfer webhook may already have landed.
    if tx.status() == TransactionStatus::Processing && tx.transfer_reference.is_none() {
        tx.record_transfer_reference(reference, Utc::now())?;
        queries::save_transaction(conn, &tx).await?;
    }
    Ok(tx)
}

async fn rollback_transfer_unit(
    conn: &mut PgConnection,
    id: Uuid,
    reason: String,
    actor: String,
    counts_attempt: bool,
) -> Result<Changed, TxFailure> {
    let mut tx = lock_existing(conn, id).await?;
    let from = tx.status();
    if from == TransactionStatus::Processing && tx.transfer_reference.is_none() {
        tx.rollback_transfer(&reason, &actor, counts_attempt, Utc::now())?;
        queries::save_transaction(conn, &tx).await?;
    }
    Ok(changed(tx, from))
}

async fn request_refund_unit(
    conn: &mut PgConnection,
    id: Uuid,
    amount: BigDecimal,
    reason: String,
    actor: String,
) -> Result<Changed, TxFailure> {
    let mut tx = lock_existing(conn, id).await?;
    let from = tx.status();
    tx.request_refund(amount, &reason, &actor, Utc::now())?;
    queries::save_transaction(conn, &tx).await?;
    Ok(changed(tx, from))
}

async fn record_refund_unit(
    conn: &mut PgConnection,
    id: Uuid,
    reference: String,
) -> Result<Transaction, TxFailure> {
    let mut tx = lock_existing(conn, id).await?;
    if tx.status() == TransactionStatus::WaitingRefund && tx.refund_reference.is_none() {
        tx.record_refund_reference(reference, Utc::now())?;
        queries::save_transaction(conn, &tx).await?;
    }
    Ok(tx)
}

async fn fail_refund_unit(conn: &mut PgConnection, id: Uuid, reason: String) -> Result<Changed, TxFailure> {
    let mut tx = lock_existing(conn, id).await?;
    let from = tx.status();
    if from == TransactionStatus::WaitingRefund {
        tx.fail_refund(&reason, Utc::now())?;
        queries::save_transaction(conn, &tx).await?;
    }
    Ok(changed(tx, from))
}

async fn cancel_unit(conn: &mut PgConnection, id: Uuid, reason: String) -> Result<Changed, TxFailure> {
    let mut tx = lock_existing(conn, id).await?;
    let from = tx.status();
    tx.cancel(SYSTEM_ACTOR, &reason, Utc::now())?;
    queries::save_transaction(conn, &tx).await?;
    Ok(changed(tx, from))
}

#[derive(Clone)]
pub struct TransferService {
    runner: TransactionRunner,
    provider: Arc<dyn PaymentProvider>,
    orders: Arc<dyn OrderDirectory>,
    sellers: Arc<dyn SellerDirectory>,
    events: EventBus,
    max_transfer_retries: i32,
}

impl TransferService {
    pub fn new(
        runner: TransactionRunner,
        provider: Arc<dyn PaymentProvider>,
        orders: Arc<dyn OrderDirectory>,
        sellers: Arc<dyn SellerDirectory>,
        events: EventBus,
        max_transfer_retries: i32,
    ) -> Self {
        Self {
            runner,
            provider,
            orders,
            sellers,
            events,
            max_transfer_retries,
        }
    }

    /// Moves a held transaction's net amount to the seller's account.
    ///
    /// `admin_override` lifts the hold-expiry and retry-ceiling guards; the
    /// order must still be delivered.
    pub async fn initiate_transfer(
        &self,
        transaction_id: Uuid,
        admin_override: bool,
        actor: &str,
        note: Option<String>,
    ) -> Result<Transaction, SettlementError> {
        let current = load_transaction(&self.runner, transaction_id).await?;
        let order_delivered = self.orders.is_delivered(current.order_id).await?;
        let destination = self
            .sellers
            .payout_destination(current.seller_id)
            .await?
            .ok_or_else(|| {
                SettlementError::Validation(format!(
                    "seller {} has no payout destination",
                    current.seller_id
                ))
            })?;

        let ctx = TransferContext {
            order_delivered,
            admin_override,
            max_transfer_retries: self.max_transfer_retries,
        };
        let actor_owned = actor.to_string();
        let (tx, events) = self
            .runner
            .run(IsolationLevel::ReadCommitted, move |conn| {
                Box::pin(begin_transfer_unit(
                    conn,
                    transaction_id,
                    ctx,
                    actor_owned.clone(),
                    note.clone(),
                ))
            })
            .await?;
        self.events.publish_all(events);

        tracing::info!(
            transaction_id = %tx.id,
            amount = %tx.net_amount(),
            currency = %tx.currency,
            admin_override,
            "Transfer initiated"
        );

        let request = TransferRequest {
            amount: tx.net_amount().clone(),
            currency: tx.currency.clone(),
            destination,
            idempotency_key: format!("transfer-{}-{}", tx.id, tx.transfer_retry_count),
            metadata: HashMap::from([
                ("transaction_id".to_string(), tx.id.to_string()),
                ("order_id".to_string(), tx.order_id.to_string()),
                ("seller_id".to_string(), tx.seller_id.to_string()),
            ]),
        };

        match self.provider.create_transfer(&request).await {
            Ok(transfer) => {
                let reference = transfer.id.clone();
                let tx = self
                    .runner
                    .run(IsolationLevel::ReadCommitted, move |conn| {
                        Box::pin(record_transfer_unit(conn, transaction_id, reference.clone()))
                    })
                    .await?;
                tracing::info!(transaction_id = %tx.id, transfer_id = %transfer.id, "Transfer created");
                Ok(tx)
            }
            Err(provider_err) => {
                tracing::error!(
                    transaction_id = %transaction_id,
                    error = %provider_err,
                    "Transfer creation failed, returning transaction to hold"
                );
                // Transient failures keep the retry count and with it the idempotency key.
                let counts_attempt = !provider_err.is_transient();
                let reason = provider_err.to_string();
                let actor_owned = actor.to_string();
                let (_, events) = self
                    .runner
                    .run(IsolationLevel::ReadCommitted, move |conn| {
                        Box::pin(rollback_transfer_unit(
                            conn,
                            transaction_id,
                            reason.clone(),
                            actor_owned.clone(),
                            counts_attempt,
                        ))
                    })
                    .await?;
                self.events.publish_all(events);
                Err(provider_err.into())
            }
        }
    }

    /// Refunds a held transaction. `amount` defaults to the full gross.
    pub async fn request_refund(
        &self,
        transaction_id: Uuid,
        amount: Option<BigDecimal>,
        reason: &str,
        actor: &str,
    ) -> Result<Transaction, SettlementError> {
        let current = load_transaction(&self.runner, transaction_id).await?;
        let payment_intent = current.payment_reference.clone().ok_or_else(|| {
            SettlementError::Validation(format!(
                "transaction {} has no captured payment to refund",
                transaction_id
            ))
        })?;
        let amount = amount.unwrap_or_else(|| current.amounts().gross_amount().clone());

        let reason_owned = reason.to_string();
        let actor_owned = actor.to_string();
        let refund_amount = amount.clone();
        let (tx, events) = self
            .runner
            .run(IsolationLevel::ReadCommitted, move |conn| {
                Box::pin(request_refund_unit(
                    conn,
                    transaction_id,
                    refund_amount.clone(),
                    reason_owned.clone(),
                    actor_owned.clone(),
                ))
            })
            .await?;
        self.events.publish_all(events);

        let request = RefundRequest {
            payment_intent,
            amount,
            currency: tx.currency.clone(),
            reason: Some(reason.to_string()),
            idempotency_key: format!("refund-{}", tx.id),
            metadata: HashMap::from([
                ("transaction_id".to_string(), tx.id.to_string()),
                ("order_id".to_string(), tx.order_id.to_string()),
            ]),
        };

        match self.provider.create_refund(&request).await {
            Ok(refund) => {
                let reference = refund.id.clone();
                let tx = self
                    .runner
                    .run(IsolationLevel::ReadCommitted, move |conn| {
                        Box::pin(record_refund_unit(conn, transaction_id, reference.clone()))
                    })
                    .await?;
                tracing::info!(
                    transaction_id = %tx.id,
                    refund_id = %refund.id,
                    status = %refund.status,
                    "Refund created"
                );
                Ok(tx)
            }
            Err(provider_err) => {
                tracing::error!(
                    transaction_id = %transaction_id,
                    error = %provider_err,
                    "Refund creation failed, leaving transaction for manual review"
                );
                let reason = provider_err.to_string();
                let (_, events) = self
                    .runner
                    .run(IsolationLevel::ReadCommitted, move |conn| {
                        Box::pin(fail_refund_unit(conn, transaction_id, reason.clone()))
                    })
                    .await?;
                self.events.publish_all(events);
                Err(provider_err.into())
            }
        }
    }

    /// Cancels a checkout that never captured.
    pub async fn cancel(&self, transaction_id: Uuid, reason: &str) -> Result<Transaction, SettlementError> {
        let reason_owned = reason.to_string();
        let (tx, events) = self
            .runner
            .run(IsolationLevel::ReadCommitted, move |conn| {
                Box::pin(cancel_unit(conn, transaction_id, reason_owned.clone()))
            })
            .await?;
        self.events.publish_all(events);
        Ok(tx)
    }
}
