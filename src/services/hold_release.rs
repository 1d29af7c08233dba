use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{queries, TransactionRunner};
use crate::domain::audit::SYSTEM_ACTOR;
use crate::domain::{Transaction, TransactionStatus};
use crate::error::SettlementError;
use crate::marketplace::OrderDirectory;
use crate::services::transfers::TransferService;

/// Where a held transaction stands in its hold period.
#[derive(Debug, Clone, Serialize)]
pub struct HoldProgress {
    pub transaction_id: Uuid,
    pub order_id: Uuid,
    pub net_amount: BigDecimal,
    pub currency: String,
    pub hold_started_at: Option<DateTime<Utc>>,
    pub planned_release_at: Option<DateTime<Utc>>,
    pub remaining_seconds: i64,
    pub percent_elapsed: f64,
    pub ready: bool,
    pub label: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SellerHoldSummary {
    pub seller_id: Uuid,
    pub held_count: usize,
    pub ready_count: usize,
    pub totals: BTreeMap<String, BigDecimal>,
    pub holds: Vec<HoldProgress>,
}

pub fn is_ready_for_release(tx: &Transaction, now: DateTime<Utc>) -> bool {
    tx.status() == TransactionStatus::Held
        && tx.planned_release_at.map_or(false, |planned| planned <= now)
}

fn describe_remaining(remaining_seconds: i64) -> String {
    if remaining_seconds <= 0 {
        return "ready for release".to_string();
    }
    let days = remaining_seconds / 86_400;
    let hours = (remaining_seconds % 86_400) / 3_600;
    match (days, hours) {
        (0, 0) => "releases within the hour".to_string(),
        (0, h) => format!("releases in {} hour{}", h, if h == 1 { "" } else { "s" }),
        (d, _) => format!("releases in {} day{}", d, if d == 1 { "" } else { "s" }),
    }
}

pub fn hold_progress(tx: &Transaction, now: DateTime<Utc>) -> HoldProgress {
    let (remaining_seconds, percent_elapsed) = match (tx.hold_started_at, tx.planned_release_at) {
        (Some(start), Some(planned)) => {
            let total = (planned - start).num_seconds();
            let elapsed = (now - start).num_seconds();
            let percent = if total <= 0 {
                100.0
            } else {
                (elapsed as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
            };
            ((planned - now).num_seconds().max(0), percent)
        }
        _ => (0, 0.0),
    };

    let ready = is_ready_for_release(tx, now);
    let label = if tx.planned_release_at.is_none() {
        "no release date".to_string()
    } else {
        describe_remaining(remaining_seconds)
    };

    HoldProgress {
        transaction_id: tx.id,
        order_id: tx.order_id,
        net_amount: tx.net_amount().clone(),
        currency: tx.currency.clone(),
        hold_started_at: tx.hold_started_at,
        planned_release_at: tx.planned_release_at,
        remaining_seconds,
        percent_elapsed: (percent_elapsed * 10.0).round() / 10.0,
        ready,
        label,
    }
}

#[derive(Clone)]
pub struct HoldReleaseManager {
    runner: TransactionRunner,
    orders: Arc<dyn OrderDirectory>,
    transfers: TransferService,
}

impl HoldReleaseManager {
    pub fn new(runner: TransactionRunner, orders: Arc<dyn OrderDirectory>, transfers: TransferService) -> Self {
        Self {
            runner,
            orders,
            transfers,
        }
    }

    /// Held transactions of a seller whose order has been delivered.
    /// Undelivered orders are left out rather than reported as errors.
    pub async fn get_seller_hold_summary(&self, seller_id: Uuid) -> Result<SellerHoldSummary, SettlementError> {
        let held = {
            let mut conn = self.runner.pool().acquire().await?;
            queries::list_seller_transactions_by_status(&mut conn, seller_id, TransactionStatus::Held).await?
        };

        let now = Utc::now();
        let mut holds = Vec::with_capacity(held.len());
        let mut totals: BTreeMap<String, BigDecimal> = BTreeMap::new();
        for tx in &held {
            match self.orders.is_delivered(tx.order_id).await {
                Ok(true) => {}
                Ok(false) => continue,
                Err(SettlementError::NotFound(_)) => {
                    tracing::debug!(transaction_id = %tx.id, order_id = %tx.order_id, "Order unknown, skipping hold");
                    continue;
                }
                Err(e) => return Err(e),
            }
            let entry = totals
                .entry(tx.currency.clone())
                .or_insert_with(|| BigDecimal::from(0));
            *entry += tx.net_amount();
            holds.push(hold_progress(tx, now));
        }

        Ok(SellerHoldSummary {
            seller_id,
            held_count: holds.len(),
            ready_count: holds.iter().filter(|h| h.ready).count(),
            totals,
            holds,
        })
    }

    /// Releases a held transaction before its planned date. The actor and
    /// their notes land in the transaction's audit trail.
    pub async fn manual_release(
        &self,
        transaction_id: Uuid,
        performed_by: &str,
        notes: Option<String>,
    ) -> Result<Transaction, SettlementError> {
        let note = Some(match notes {
            Some(text) if !text.trim().is_empty() => format!("manual release: {}", text.trim()),
            _ => "manual release".to_string(),
        });
        tracing::info!(%transaction_id, performed_by, "Manual hold release requested");
        self.transfers
            .initiate_transfer(transaction_id, true, performed_by, note)
            .await
    }

    /// Initiates transfers for every held transaction of the seller whose hold
    /// has expired. Per-transaction failures are logged and skipped.
    pub async fn release_due(&self, seller_id: Uuid) -> Result<Vec<Transaction>, SettlementError> {
        let now = Utc::now();
        let ready = {
            let mut conn = self.runner.pool().acquire().await?;
            queries::list_ready_for_release(&mut conn, seller_id, now).await?
        };

        let mut released = Vec::new();
        for tx in ready {
            match self.transfers.initiate_transfer(tx.id, false, SYSTEM_ACTOR, None).await {
                Ok(updated) => released.push(updated),
                Err(SettlementError::TransferGuard { reason, .. }) => {
                    tracing::info!(transaction_id = %tx.id, %reason, "Transaction not released yet");
                }
                Err(e) => {
                    tracing::error!(transaction_id = %tx.id, error = %e, "Failed to release transaction");
                }
            }
        }
        Ok(released)
    }
}
