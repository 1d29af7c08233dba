//! Payout batches: aggregation, provider status reconciliation and the
//! administrative retry path.
//!
//! Multi-row units lock in a fixed order (transactions, then the payout, then
//! its items) so they never deadlock against the webhook handlers.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::PgConnection;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{queries, IsolationLevel, TransactionRunner, TxFailure};
use crate::domain::money::round_money;
use crate::domain::{
    ExchangeRateSnapshot, FailureInfo, Payout, PayoutItem, PayoutItemStatus, PayoutStatus,
    PayoutTransition, ReconciliationStatus, Transaction,
};
use crate::error::SettlementError;
use crate::marketplace::SellerDirectory;
use crate::provider::{PaymentProvider, PayoutRequest};
use crate::services::currency::CurrencyResolver;
use crate::services::events::{EventBus, SettlementEvent};
use crate::services::hold_release::HoldReleaseManager;

/// A provider (or operator) report about a payout's status.
#[derive(Debug, Clone)]
pub struct PayoutStatusUpdate {
    pub status: PayoutStatus,
    pub failure: Option<FailureInfo>,
    pub reported_amount: Option<BigDecimal>,
    pub arrival_date: Option<DateTime<Utc>>,
    pub note: Option<String>,
    pub actor: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PayoutDetails {
    #[serde(flatten)]
    pub payout: Payout,
    pub items: Vec<PayoutItem>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ForceRetryOutcome {
    pub previous: Payout,
    pub created: Vec<Payout>,
}

/// Idempotency key for a batch. The generation is the number of payout items
/// already recorded for these transactions, so a batch re-run after a failed
/// payout gets a fresh key while a retried unit of work reuses the old one.
pub fn batch_idempotency_key(seller_id: Uuid, currency: &str, transaction_ids: &[Uuid], generation: i64) -> String {
    let mut ids = transaction_ids.to_vec();
    ids.sort();

    let mut hasher = Sha256::new();
    hasher.update(seller_id.as_bytes());
    hasher.update(currency.as_bytes());
    for id in &ids {
        hasher.update(id.as_bytes());
    }
    hasher.update(generation.to_be_bytes());
    format!("payout-{}", hex::encode(hasher.finalize()))
}

/// Payout id derived from the batch key so a re-run unit sends the same
/// metadata to the provider.
fn batch_payout_id(idempotency_key: &str) -> Uuid {
    let digest = Sha256::digest(idempotency_key.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    uuid::Builder::from_random_bytes(bytes).into_uuid()
}

#[derive(Clone)]
struct BatchContext {
    seller_id: Uuid,
    currency: String,
    destination: String,
    provider: Arc<dyn PaymentProvider>,
    resolver: CurrencyResolver,
}

async fn create_batch_unit(
    conn: &mut PgConnection,
    ctx: BatchContext,
) -> Result<Option<(Payout, Vec<SettlementEvent>)>, TxFailure> {
    let now = Utc::now();
    let mut candidates = queries::lock_payout_candidates(conn, ctx.seller_id, &ctx.currency).await?;
    if candidates.is_empty() {
        return Ok(None);
    }

    let ids: Vec<Uuid> = candidates.iter().map(|tx| tx.id).collect();
    let total = round_money(
        &candidates
            .iter()
            .fold(BigDecimal::from(0), |acc, tx| acc + tx.net_amount()),
    );
    let fee_total = round_money(&candidates.iter().fold(BigDecimal::from(0), |acc, tx| {
        acc + tx.amounts().platform_fee() + tx.amounts().provider_fee()
    }));
    let generation = queries::count_payout_items_for_transactions(conn, &ids).await?;
    let idempotency_key = batch_idempotency_key(ctx.seller_id, &ctx.currency, &ids, generation);
    let payout_id = batch_payout_id(&idempotency_key);

    let resolution = ctx
        .resolver
        .resolve(&ctx.currency, &total, &ctx.destination, now)
        .await?;

    let account = ctx
        .provider
        .retrieve_account(&ctx.destination)
        .await
        .map_err(SettlementError::from)?;
    if !account.payouts_enabled {
        return Err(SettlementError::Validation(format!(
            "account {} cannot receive payouts yet",
            ctx.destination
        ))
        .into());
    }

    let request = PayoutRequest {
        account: ctx.destination.clone(),
        amount: resolution.amount.clone(),
        currency: resolution.currency.clone(),
        idempotency_key: idempotency_key.clone(),
        metadata: HashMap::from([
            ("seller_id".to_string(), ctx.seller_id.to_string()),
            ("payout_id".to_string(), payout_id.to_string()),
        ]),
    };
    let provider_payout = ctx
        .provider
        .create_payout(&request)
        .await
        .map_err(SettlementError::from)?;

    let mut payout = Payout {
        id: payout_id,
        seller_id: ctx.seller_id,
        provider_payout_id: Some(provider_payout.id.clone()),
        destination_account: ctx.destination.clone(),
        idempotency_key,
        total_amount: resolution.amount.clone(),
        currency: resolution.currency.clone(),
        fee_total,
        status: PayoutStatus::Pending,
        failure_code: None,
        failure_message: None,
        arrival_date: provider_payout
            .arrival_date
            .and_then(|ts| Utc.timestamp_opt(ts, 0).single()),
        reconciliation_status: ReconciliationStatus::Unreconciled,
        retry_count: 0,
        status_history: Vec::new(),
        created_at: now,
        updated_at: now,
    };
    let note = if resolution.converted {
        format!(
            "created for {} {} funded as {} {} at rate {}",
            total, ctx.currency, resolution.amount, resolution.currency, resolution.rate
        )
    } else {
        format!("created for {} {}", total, ctx.currency)
    };
    payout.status_history.push(crate::domain::StatusChange {
        status: PayoutStatus::Pending.as_str().to_string(),
        at: now,
        note: Some(note),
    });

    let mut persisted: Vec<Uuid> = Vec::with_capacity(candidates.len());
    let outcome = persist_batch(conn, &payout, &mut candidates, &mut persisted, now).await;
    if let Err(err) = outcome {
        let pending: Vec<Uuid> = ids.iter().filter(|id| !persisted.contains(id)).copied().collect();
        tracing::error!(
            payout_id = %payout.id,
            provider_payout_id = %provider_payout.id,
            attempted = ?persisted,
            not_reached = ?pending,
            error = %err,
            "Provider payout created but batch could not be recorded; unit rolled back"
        );
        return Err(err);
    }

    tracing::info!(
        payout_id = %payout.id,
        provider_payout_id = %provider_payout.id,
        seller_id = %ctx.seller_id,
        amount = %payout.total_amount,
        currency = %payout.currency,
        items = candidates.len(),
        "Payout created"
    );
    let events = vec![SettlementEvent::for_payout(&payout, None)];
    Ok(Some((payout, events)))
}

async fn persist_batch(
    conn: &mut PgConnection,
    payout: &Payout,
    candidates: &mut [Transaction],
    persisted: &mut Vec<Uuid>,
    now: DateTime<Utc>,
) -> Result<(), TxFailure> {
    queries::insert_payout(conn, payout).await?;
    for tx in candidates.iter_mut() {
        let item = PayoutItem {
            id: Uuid::new_v4(),
            payout_id: payout.id,
            transaction_id: tx.id,
            order_id: tx.order_id,
            amount: tx.net_amount().clone(),
            currency: tx.currency.clone(),
            status: PayoutItemStatus::Pending,
            paid_at: None,
            created_at: now,
        };
        queries::insert_payout_item(conn, &item).await?;
        tx.claim_for_payout(now)?;
        queries::save_transaction(conn, tx).await?;
        persisted.push(tx.id);
    }
    Ok(())
}

/// Releases the claims a payout holds. Items voided by a failed transfer no
/// longer own their transaction, and a claim held by a newer live batch is
/// left alone.
async fn release_claims(
    conn: &mut PgConnection,
    payout_id: Uuid,
    transactions: &mut [Transaction],
    items: &[PayoutItem],
    actor: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> Result<usize, TxFailure> {
    let mut released = 0;
    for tx in transactions.iter_mut() {
        let listed = items
            .iter()
            .any(|item| item.transaction_id == tx.id && item.status != PayoutItemStatus::Voided);
        if !listed || !tx.payout_claimed() {
            continue;
        }
        match queries::active_payout_for_transaction(conn, tx.id).await? {
            Some(owner) if owner != payout_id => {
                tracing::info!(
                    %payout_id,
                    transaction_id = %tx.id,
                    owner = %owner,
                    "Claim held by a newer payout; leaving it"
                );
            }
            _ => {
                tx.release_payout_claim(actor, reason, now);
                queries::save_transaction(conn, tx).await?;
                released += 1;
            }
        }
    }
    Ok(released)
}

/// Applies a payout status report inside the caller's unit of work.
pub(crate) async fn apply_payout_status(
    conn: &mut PgConnection,
    payout_id: Uuid,
    update: &PayoutStatusUpdate,
) -> Result<(Payout, Vec<SettlementEvent>), TxFailure> {
    let now = Utc::now();
    let transaction_ids = queries::payout_transaction_ids(conn, payout_id).await?;
    let mut transactions = queries::lock_transactions(conn, &transaction_ids).await?;
    let mut payout = queries::lock_payout(conn, payout_id)
        .await?
        .ok_or_else(|| SettlementError::NotFound(format!("payout {}", payout_id)))?;
    let items = queries::lock_payout_items(conn, payout_id).await?;

    let transition = payout.apply_status(update.status, update.failure.as_ref(), update.note.clone(), now);
    let mut events = Vec::new();
    match transition {
        PayoutTransition::Regression => {
            tracing::info!(
                %payout_id,
                current = %payout.status(),
                reported = %update.status,
                "Ignoring out-of-order payout status"
            );
            return Ok((payout, events));
        }
        PayoutTransition::Unchanged => {}
        PayoutTransition::Applied { from, to } => {
            if to == PayoutStatus::Paid {
                if let Some(reported) = &update.reported_amount {
                    if reported != &payout.total_amount {
                        tracing::warn!(
                            %payout_id,
                            expected = %payout.total_amount,
                            %reported,
                            "Paid payout amount differs from batch total"
                        );
                        payout.set_reconciliation(
                            ReconciliationStatus::Discrepancy,
                            format!("provider paid {} but batch total is {}", reported, payout.total_amount),
                            now,
                        );
                    }
                }
            }
            if to.releases_claims() {
                let reason = format!("payout {} {}", payout.id, to);
                let released =
                    release_claims(conn, payout_id, &mut transactions, &items, &update.actor, &reason, now).await?;
                tracing::info!(%payout_id, status = %to, released, "Payout claims released");
            }
            events.push(SettlementEvent::for_payout(&payout, Some(from)));
        }
    }

    if let Some(arrival) = update.arrival_date {
        payout.arrival_date = Some(arrival);
        payout.updated_at = now;
    }
    queries::save_payout(conn, &payout).await?;
    Ok((payout, events))
}

async fn reconcile_unit(
    conn: &mut PgConnection,
    payout_id: Uuid,
    reconciliation: ReconciliationStatus,
    update: Option<PayoutStatusUpdate>,
    note: String,
) -> Result<(Payout, Vec<SettlementEvent>), TxFailure> {
    let mut events = Vec::new();
    if let Some(update) = &update {
        let (_, applied) = apply_payout_status(conn, payout_id, update).await?;
        events.extend(applied);
    }
    let mut payout = queries::lock_payout(conn, payout_id)
        .await?
        .ok_or_else(|| SettlementError::NotFound(format!("payout {}", payout_id)))?;
    payout.set_reconciliation(reconciliation, note, Utc::now());
    queries::save_payout(conn, &payout).await?;
    Ok((payout, events))
}

async fn force_retry_unit(
    conn: &mut PgConnection,
    payout_id: Uuid,
    actor: String,
    stuck_after: Duration,
) -> Result<(Payout, Vec<SettlementEvent>), TxFailure> {
    let now = Utc::now();
    let transaction_ids = queries::payout_transaction_ids(conn, payout_id).await?;
    let mut transactions = queries::lock_transactions(conn, &transaction_ids).await?;
    let mut payout = queries::lock_payout(conn, payout_id)
        .await?
        .ok_or_else(|| SettlementError::NotFound(format!("payout {}", payout_id)))?;
    let items = queries::lock_payout_items(conn, payout_id).await?;

    if !payout.can_force_retry(now, stuck_after) {
        return Err(SettlementError::invalid_transition(
            "payout",
            payout.id,
            "failed, canceled or stuck pending",
            payout.status(),
        )
        .into());
    }

    let mut events = Vec::new();
    if payout.status() == PayoutStatus::Pending {
        let failure = FailureInfo {
            code: Some("force_retry".to_string()),
            message: Some(format!("stuck payout abandoned by {}", actor)),
        };
        if let PayoutTransition::Applied { from, .. } = payout.apply_status(
            PayoutStatus::Failed,
            Some(&failure),
            Some(format!("force retry by {}", actor)),
            now,
        ) {
            events.push(SettlementEvent::for_payout(&payout, Some(from)));
        }
    }

    let reason = format!("force retry of payout {}", payout.id);
    release_claims(conn, payout_id, &mut transactions, &items, &actor, &reason, now).await?;
    payout.retry_count += 1;
    payout.updated_at = now;
    queries::save_payout(conn, &payout).await?;
    Ok((payout, events))
}

#[derive(Clone)]
pub struct PayoutAggregator {
    runner: TransactionRunner,
    provider: Arc<dyn PaymentProvider>,
    sellers: Arc<dyn SellerDirectory>,
    resolver: CurrencyResolver,
    holds: HoldReleaseManager,
    events: EventBus,
    stuck_after: Duration,
}

impl PayoutAggregator {
    pub fn new(
        runner: TransactionRunner,
        provider: Arc<dyn PaymentProvider>,
        sellers: Arc<dyn SellerDirectory>,
        resolver: CurrencyResolver,
        holds: HoldReleaseManager,
        events: EventBus,
        stuck_after: Duration,
    ) -> Self {
        Self {
            runner,
            provider,
            sellers,
            resolver,
            holds,
            events,
            stuck_after,
        }
    }

    /// Unclaimed transactions released from hold, by status or by release
    /// timestamp.
    pub async fn select_eligible_transactions(&self, seller_id: Uuid) -> Result<Vec<Transaction>, SettlementError> {
        let mut conn = self.runner.pool().acquire().await?;
        queries::select_eligible_transactions(&mut conn, seller_id).await
    }

    /// Releases due holds, then creates one payout per currency with payable
    /// transactions. Stops at the first failing currency; batches created
    /// before it stay committed.
    pub async fn create_payout(&self, seller_id: Uuid) -> Result<Vec<Payout>, SettlementError> {
        let destination = self
            .sellers
            .payout_destination(seller_id)
            .await?
            .ok_or_else(|| {
                SettlementError::Validation(format!("seller {} has no payout destination", seller_id))
            })?;

        let released = self.holds.release_due(seller_id).await?;
        if !released.is_empty() {
            tracing::info!(%seller_id, count = released.len(), "Released due holds before payout");
        }

        let currencies = {
            let mut conn = self.runner.pool().acquire().await?;
            queries::payout_candidate_currencies(&mut conn, seller_id).await?
        };

        let mut payouts = Vec::new();
        for currency in currencies {
            let ctx = BatchContext {
                seller_id,
                currency: currency.clone(),
                destination: destination.clone(),
                provider: self.provider.clone(),
                resolver: self.resolver.clone(),
            };
            let created = self
                .runner
                .run(IsolationLevel::ReadCommitted, move |conn| {
                    Box::pin(create_batch_unit(conn, ctx.clone()))
                })
                .await;

            match created {
                Ok(Some((payout, events))) => {
                    self.events.publish_all(events);
                    payouts.push(payout);
                }
                Ok(None) => tracing::info!(%seller_id, %currency, "No payable transactions"),
                Err(e) => {
                    tracing::error!(
                        %seller_id,
                        %currency,
                        created = payouts.len(),
                        error = %e,
                        "Payout creation failed"
                    );
                    return Err(e);
                }
            }
        }
        Ok(payouts)
    }

    /// Provider-reported status change, outside of a webhook delivery.
    pub async fn reconcile_payout_webhook(
        &self,
        payout_id: Uuid,
        update: PayoutStatusUpdate,
    ) -> Result<Payout, SettlementError> {
        let (payout, events) = self
            .runner
            .run(IsolationLevel::ReadCommitted, move |conn| {
                let update = update.clone();
                Box::pin(async move { apply_payout_status(conn, payout_id, &update).await })
            })
            .await?;
        self.events.publish_all(events);
        Ok(payout)
    }

    /// Operator bookkeeping confirmation, optionally correcting the status.
    pub async fn reconcile_payout(
        &self,
        payout_id: Uuid,
        reconciliation: ReconciliationStatus,
        status: Option<PayoutStatus>,
        note: Option<String>,
        actor: &str,
    ) -> Result<Payout, SettlementError> {
        let note = match note {
            Some(text) => format!("{}: {}", actor, text),
            None => format!("reconciled by {}", actor),
        };
        let update = status.map(|status| PayoutStatusUpdate {
            status,
            failure: None,
            reported_amount: None,
            arrival_date: None,
            note: Some(note.clone()),
            actor: actor.to_string(),
        });

        let (payout, events) = self
            .runner
            .run(IsolationLevel::ReadCommitted, move |conn| {
                Box::pin(reconcile_unit(conn, payout_id, reconciliation, update.clone(), note.clone()))
            })
            .await?;
        self.events.publish_all(events);
        tracing::info!(%payout_id, reconciliation = reconciliation.as_str(), actor, "Payout reconciled");
        Ok(payout)
    }

    /// Abandons a failed, canceled or stuck payout and batches its
    /// transactions again.
    pub async fn force_retry_payout(&self, payout_id: Uuid, actor: &str) -> Result<ForceRetryOutcome, SettlementError> {
        let actor_owned = actor.to_string();
        let stuck_after = self.stuck_after;
        let (previous, events) = self
            .runner
            .run(IsolationLevel::ReadCommitted, move |conn| {
                Box::pin(force_retry_unit(conn, payout_id, actor_owned.clone(), stuck_after))
            })
            .await?;
        self.events.publish_all(events);
        tracing::info!(%payout_id, actor, retry_count = previous.retry_count, "Payout force-retried");

        let created = self.create_payout(previous.seller_id).await?;
        Ok(ForceRetryOutcome { previous, created })
    }

    pub async fn get_payout(&self, payout_id: Uuid) -> Result<PayoutDetails, SettlementError> {
        let mut conn = self.runner.pool().acquire().await?;
        let payout = queries::get_payout(&mut conn, payout_id)
            .await?
            .ok_or_else(|| SettlementError::NotFound(format!("payout {}", payout_id)))?;
        let items = queries::list_payout_items(&mut conn, payout_id).await?;
        Ok(PayoutDetails { payout, items })
    }

    pub async fn list_payouts(&self, seller_id: Uuid) -> Result<Vec<Payout>, SettlementError> {
        let mut conn = self.runner.pool().acquire().await?;
        queries::list_seller_payouts(&mut conn, seller_id).await
    }

    pub async fn record_exchange_rate(
        &self,
        base_currency: &str,
        target_currency: &str,
        rate: BigDecimal,
        source: &str,
    ) -> Result<ExchangeRateSnapshot, SettlementError> {
        let snapshot = ExchangeRateSnapshot::new(base_currency, target_currency, rate, Utc::now(), source)?;
        let mut conn = self.runner.pool().acquire().await?;
        queries::insert_exchange_rate(&mut conn, &snapshot).await?;
        tracing::info!(
            base = %snapshot.base_currency,
            target = %snapshot.target_currency,
            rate = %snapshot.rate,
            "Exchange rate recorded"
        );
        Ok(snapshot)
    }
}
