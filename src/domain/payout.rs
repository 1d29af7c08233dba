//! Payout batches and their line items.

use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::audit::StatusChange;
use crate::error::SettlementError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutStatus {
    Pending,
    InTransit,
    Paid,
    Failed,
    Canceled,
}

impl PayoutStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::InTransit => "in_transit",
            PayoutStatus::Paid => "paid",
            PayoutStatus::Failed => "failed",
            PayoutStatus::Canceled => "canceled",
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(
            self,
            PayoutStatus::Paid | PayoutStatus::Failed | PayoutStatus::Canceled
        )
    }

    /// A failed or canceled payout no longer owns its transactions.
    pub fn releases_claims(&self) -> bool {
        matches!(self, PayoutStatus::Failed | PayoutStatus::Canceled)
    }

    fn rank(&self) -> u8 {
        match self {
            PayoutStatus::Pending => 0,
            PayoutStatus::InTransit => 1,
            PayoutStatus::Paid | PayoutStatus::Failed | PayoutStatus::Canceled => 2,
        }
    }
}

impl fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PayoutStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PayoutStatus::Pending),
            "in_transit" => Ok(PayoutStatus::InTransit),
            "paid" => Ok(PayoutStatus::Paid),
            "failed" => Ok(PayoutStatus::Failed),
            "canceled" | "cancelled" => Ok(PayoutStatus::Canceled),
            other => Err(SettlementError::InvalidPayload(format!(
                "unknown payout status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationStatus {
    Unreconciled,
    Reconciled,
    Discrepancy,
}

impl ReconciliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationStatus::Unreconciled => "unreconciled",
            ReconciliationStatus::Reconciled => "reconciled",
            ReconciliationStatus::Discrepancy => "discrepancy",
        }
    }
}

impl FromStr for ReconciliationStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unreconciled" => Ok(ReconciliationStatus::Unreconciled),
            "reconciled" => Ok(ReconciliationStatus::Reconciled),
            "discrepancy" => Ok(ReconciliationStatus::Discrepancy),
            other => Err(SettlementError::InvalidPayload(format!(
                "unknown reconciliation status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayoutItemStatus {
    Pending,
    Paid,
    Voided,
}

impl PayoutItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PayoutItemStatus::Pending => "pending",
            PayoutItemStatus::Paid => "paid",
            PayoutItemStatus::Voided => "voided",
        }
    }
}

impl FromStr for PayoutItemStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PayoutItemStatus::Pending),
            "paid" => Ok(PayoutItemStatus::Paid),
            "voided" => Ok(PayoutItemStatus::Voided),
            other => Err(SettlementError::InvalidPayload(format!(
                "unknown payout item status '{}'",
                other
            ))),
        }
    }
}

/// Failure details reported by the provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub code: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Payout {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub provider_payout_id: Option<String>,
    pub destination_account: String,
    pub idempotency_key: String,
    pub total_amount: BigDecimal,
    pub currency: String,
    pub fee_total: BigDecimal,
    pub(crate) status: PayoutStatus,
    pub failure_code: Option<String>,
    pub failure_message: Option<String>,
    pub arrival_date: Option<DateTime<Utc>>,
    pub reconciliation_status: ReconciliationStatus,
    pub retry_count: i32,
    pub status_history: Vec<StatusChange>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What a status report did to a payout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayoutTransition {
    Applied {
        from: PayoutStatus,
        to: PayoutStatus,
    },
    /// Same status delivered again.
    Unchanged,
    /// Older status delivered after a newer one; ignored.
    Regression,
}

impl Payout {
    pub fn status(&self) -> PayoutStatus {
        self.status
    }

    /// Applies a provider status report. Final states never move and
    /// out-of-order reports for earlier states are dropped.
    pub fn apply_status(
        &mut self,
        next: PayoutStatus,
        failure: Option<&FailureInfo>,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> PayoutTransition {
        if next == self.status {
            return PayoutTransition::Unchanged;
        }
        if self.status.is_final() || next.rank() < self.status.rank() {
            return PayoutTransition::Regression;
        }

        let from = self.status;
        self.status = next;
        if next == PayoutStatus::Failed {
            if let Some(info) = failure {
                self.failure_code = info.code.clone();
                self.failure_message = info.message.clone();
            }
        }
        self.status_history.push(StatusChange {
            status: next.as_str().to_string(),
            at: now,
            note,
        });
        self.updated_at = now;
        PayoutTransition::Applied { from, to: next }
    }

    pub fn set_reconciliation(
        &mut self,
        status: ReconciliationStatus,
        note: impl Into<String>,
        now: DateTime<Utc>,
    ) {
        self.reconciliation_status = status;
        self.status_history.push(StatusChange {
            status: format!("reconciliation:{}", status.as_str()),
            at: now,
            note: Some(note.into()),
        });
        self.updated_at = now;
    }

    /// Whether an operator may force a retry at `now`.
    pub fn can_force_retry(&self, now: DateTime<Utc>, stuck_after: chrono::Duration) -> bool {
        match self.status {
            PayoutStatus::Failed | PayoutStatus::Canceled => true,
            PayoutStatus::Pending => self.created_at + stuck_after <= now,
            PayoutStatus::InTransit | PayoutStatus::Paid => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PayoutItem {
    pub id: Uuid,
    pub payout_id: Uuid,
    pub transaction_id: Uuid,
    pub order_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub status: PayoutItemStatus,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}
