//! Settlement transaction entity and its lifecycle.
//!
//! One transaction exists per (order, seller). Every status change goes through
//! a method on [`Transaction`] that checks the expected pre-state first; callers
//! never assign `status` directly.

use bigdecimal::{BigDecimal, Zero};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::audit::AuditNote;
use super::money::round_money;
use crate::error::SettlementError;

const ENTITY: &str = "transaction";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Held,
    Processing,
    Released,
    WaitingRefund,
    Refunded,
    FailedRefund,
    Canceled,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Held => "held",
            TransactionStatus::Processing => "processing",
            TransactionStatus::Released => "released",
            TransactionStatus::WaitingRefund => "waiting_refund",
            TransactionStatus::Refunded => "refunded",
            TransactionStatus::FailedRefund => "failed_refund",
            TransactionStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransactionStatus::Released
                | TransactionStatus::Refunded
                | TransactionStatus::FailedRefund
                | TransactionStatus::Canceled
        )
    }

    /// The hold has been lifted: a transfer is in flight or has landed.
    pub fn is_released_from_hold(&self) -> bool {
        matches!(self, TransactionStatus::Processing | TransactionStatus::Released)
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = SettlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TransactionStatus::Pending),
            "held" => Ok(TransactionStatus::Held),
            "processing" => Ok(TransactionStatus::Processing),
            "released" => Ok(TransactionStatus::Released),
            "waiting_refund" => Ok(TransactionStatus::WaitingRefund),
            "refunded" => Ok(TransactionStatus::Refunded),
            "failed_refund" => Ok(TransactionStatus::FailedRefund),
            "canceled" => Ok(TransactionStatus::Canceled),
            other => Err(SettlementError::InvalidPayload(format!(
                "unknown transaction status '{}'",
                other
            ))),
        }
    }
}

/// Gross, fees and the derived net amount. Net is never set on its own.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettlementAmounts {
    gross_amount: BigDecimal,
    platform_fee: BigDecimal,
    provider_fee: BigDecimal,
    net_amount: BigDecimal,
}

impl SettlementAmounts {
    pub fn new(
        gross_amount: BigDecimal,
        platform_fee: BigDecimal,
        provider_fee: BigDecimal,
    ) -> Result<Self, SettlementError> {
        if gross_amount < BigDecimal::zero()
            || platform_fee < BigDecimal::zero()
            || provider_fee < BigDecimal::zero()
        {
            return Err(SettlementError::Validation(
                "amounts must not be negative".to_string(),
            ));
        }
        let net_amount = round_money(&(&gross_amount - &platform_fee - &provider_fee));
        if net_amount < BigDecimal::zero() {
            return Err(SettlementError::Validation(format!(
                "fees {} + {} exceed gross {}",
                platform_fee, provider_fee, gross_amount
            )));
        }
        Ok(Self {
            gross_amount,
            platform_fee,
            provider_fee,
            net_amount,
        })
    }

    pub fn gross_amount(&self) -> &BigDecimal {
        &self.gross_amount
    }

    pub fn platform_fee(&self) -> &BigDecimal {
        &self.platform_fee
    }

    pub fn provider_fee(&self) -> &BigDecimal {
        &self.provider_fee
    }

    pub fn net_amount(&self) -> &BigDecimal {
        &self.net_amount
    }
}

/// Signals the transfer guard needs besides the transaction itself.
#[derive(Debug, Clone, Copy)]
pub struct TransferContext {
    pub order_delivered: bool,
    pub admin_override: bool,
    pub max_transfer_retries: i32,
}

#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub order_id: Uuid,
    pub seller_id: Uuid,
    pub buyer_id: Uuid,
    pub payment_reference: Option<String>,
    pub amounts: SettlementAmounts,
    pub currency: String,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: Uuid,
    pub order_id: Uuid,
    pub seller_id: Uuid,
    pub buyer_id: Uuid,
    pub payment_reference: Option<String>,
    pub transfer_reference: Option<String>,
    pub refund_reference: Option<String>,
    #[serde(flatten)]
    pub(crate) amounts: SettlementAmounts,
    pub refund_amount: Option<BigDecimal>,
    pub currency: String,
    pub(crate) status: TransactionStatus,
    pub hold_reason: Option<String>,
    pub payment_received_at: Option<DateTime<Utc>>,
    pub hold_started_at: Option<DateTime<Utc>>,
    pub planned_release_at: Option<DateTime<Utc>>,
    pub actual_release_at: Option<DateTime<Utc>>,
    pub(crate) payout_claimed: bool,
    pub transfer_retry_count: i32,
    pub status_changed_at: DateTime<Utc>,
    pub notes: Vec<AuditNote>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transaction {
    pub fn new(input: NewTransaction, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            order_id: input.order_id,
            seller_id: input.seller_id,
            buyer_id: input.buyer_id,
            payment_reference: input.payment_reference,
            transfer_reference: None,
            refund_reference: None,
            amounts: input.amounts,
            refund_amount: None,
            currency: input.currency.to_ascii_lowercase(),
            status: TransactionStatus::Pending,
            hold_reason: None,
            payment_received_at: None,
            hold_started_at: None,
            planned_release_at: None,
            actual_release_at: None,
            payout_claimed: false,
            transfer_retry_count: 0,
            status_changed_at: now,
            notes: Vec::new(),
            metadata: input.metadata,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    pub fn amounts(&self) -> &SettlementAmounts {
        &self.amounts
    }

    pub fn net_amount(&self) -> &BigDecimal {
        self.amounts.net_amount()
    }

    pub fn payout_claimed(&self) -> bool {
        self.payout_claimed
    }

    /// Replaces the fees; net is recomputed from the current gross.
    pub fn update_fees(
        &mut self,
        platform_fee: BigDecimal,
        provider_fee: BigDecimal,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        self.amounts =
            SettlementAmounts::new(self.amounts.gross_amount.clone(), platform_fee, provider_fee)?;
        self.updated_at = now;
        Ok(())
    }

    pub fn append_note(&mut self, actor: &str, message: impl Into<String>, now: DateTime<Utc>) {
        self.notes.push(AuditNote::new(now, actor, message));
        self.updated_at = now;
    }

    fn expect_status(&self, expected: TransactionStatus) -> Result<(), SettlementError> {
        if self.status != expected {
            return Err(SettlementError::invalid_transition(
                ENTITY,
                self.id,
                expected,
                self.status,
            ));
        }
        Ok(())
    }

    fn move_to(&mut self, next: TransactionStatus, now: DateTime<Utc>) -> TransactionStatus {
        let previous = self.status;
        self.status = next;
        self.status_changed_at = now;
        self.updated_at = now;
        previous
    }

    /// `pending -> held` once the provider confirms capture.
    pub fn mark_held(
        &mut self,
        payment_reference: Option<String>,
        hold_days: i64,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        self.expect_status(TransactionStatus::Pending)?;
        if payment_reference.is_some() {
            self.payment_reference = payment_reference;
        }
        self.payment_received_at = Some(now);
        if self.hold_started_at.is_none() {
            self.hold_started_at = Some(now);
            self.planned_release_at = Some(compute_release_date(now, hold_days));
        }
        self.hold_reason = Some("standard_hold".to_string());
        self.move_to(TransactionStatus::Held, now);
        self.append_note(
            super::audit::WEBHOOK_ACTOR,
            format!("payment captured, funds held for {} days", hold_days),
            now,
        );
        Ok(())
    }

    /// `pending -> canceled` for checkouts that never captured.
    pub fn cancel(&mut self, actor: &str, reason: &str, now: DateTime<Utc>) -> Result<(), SettlementError> {
        self.expect_status(TransactionStatus::Pending)?;
        self.move_to(TransactionStatus::Canceled, now);
        self.append_note(actor, format!("canceled: {}", reason), now);
        Ok(())
    }

    /// `held -> waiting_refund` on a cancellation request.
    pub fn request_refund(
        &mut self,
        amount: BigDecimal,
        reason: &str,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        self.expect_status(TransactionStatus::Held)?;
        if amount <= BigDecimal::zero() || &amount > self.amounts.gross_amount() {
            return Err(SettlementError::Validation(format!(
                "refund amount {} must be positive and at most {}",
                amount,
                self.amounts.gross_amount()
            )));
        }
        self.move_to(TransactionStatus::WaitingRefund, now);
        self.append_note(
            actor,
            format!("refund of {} {} requested: {}", amount, self.currency, reason),
            now,
        );
        self.refund_amount = Some(amount);
        Ok(())
    }

    pub fn record_refund_reference(
        &mut self,
        reference: String,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        self.expect_status(TransactionStatus::WaitingRefund)?;
        self.refund_reference = Some(reference);
        self.updated_at = now;
        Ok(())
    }

    /// `waiting_refund -> refunded`.
    pub fn complete_refund(&mut self, reference: Option<String>, now: DateTime<Utc>) -> Result<(), SettlementError> {
        self.expect_status(TransactionStatus::WaitingRefund)?;
        if reference.is_some() {
            self.refund_reference = reference;
        }
        self.move_to(TransactionStatus::Refunded, now);
        self.append_note(super::audit::WEBHOOK_ACTOR, "refund succeeded", now);
        Ok(())
    }

    /// `waiting_refund -> failed_refund`. Left for manual intervention.
    pub fn fail_refund(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), SettlementError> {
        self.expect_status(TransactionStatus::WaitingRefund)?;
        self.move_to(TransactionStatus::FailedRefund, now);
        self.append_note(
            super::audit::WEBHOOK_ACTOR,
            format!("refund failed: {}", reason),
            now,
        );
        Ok(())
    }

    /// Checks the transfer guard without mutating anything.
    pub fn check_transfer_guard(
        &self,
        ctx: &TransferContext,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        self.expect_status(TransactionStatus::Held)?;
        let guard = |reason: &str| SettlementError::TransferGuard {
            id: self.id.to_string(),
            reason: reason.to_string(),
        };

        if !ctx.order_delivered {
            return Err(guard("order has not been delivered"));
        }
        if ctx.admin_override {
            return Ok(());
        }
        match self.planned_release_at {
            Some(planned) if planned <= now => {}
            Some(_) => return Err(guard("hold period has not expired")),
            None => return Err(guard("no planned release date")),
        }
        if self.transfer_retry_count >= ctx.max_transfer_retries {
            return Err(guard("transfer retries exhausted, administrative override required"));
        }
        Ok(())
    }

    /// `held -> processing` when a transfer is initiated.
    pub fn begin_transfer(
        &mut self,
        ctx: &TransferContext,
        actor: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        self.check_transfer_guard(ctx, now)?;
        self.transfer_reference = None;
        self.move_to(TransactionStatus::Processing, now);
        let message = if ctx.admin_override {
            "transfer initiated with administrative override"
        } else {
            "transfer initiated after hold expiry"
        };
        self.append_note(actor, message, now);
        Ok(())
    }

    pub fn record_transfer_reference(
        &mut self,
        reference: String,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        self.expect_status(TransactionStatus::Processing)?;
        self.transfer_reference = Some(reference);
        self.updated_at = now;
        Ok(())
    }

    /// `processing -> released` on the provider's transfer confirmation.
    pub fn complete_transfer(
        &mut self,
        reference: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        self.expect_status(TransactionStatus::Processing)?;
        if self.transfer_reference.is_none() {
            self.transfer_reference = Some(reference.to_string());
        }
        if self.actual_release_at.is_none() {
            self.actual_release_at = Some(now);
        }
        self.hold_reason = None;
        self.move_to(TransactionStatus::Released, now);
        self.append_note(
            super::audit::WEBHOOK_ACTOR,
            format!("transfer {} confirmed", reference),
            now,
        );
        Ok(())
    }

    /// `processing -> held` when the transfer fails; the transaction becomes
    /// eligible for another attempt until the retry ceiling.
    pub fn rollback_transfer(
        &mut self,
        reason: &str,
        actor: &str,
        counts_attempt: bool,
        now: DateTime<Utc>,
    ) -> Result<(), SettlementError> {
        self.expect_status(TransactionStatus::Processing)?;
        let reference = self.transfer_reference.take();
        if counts_attempt {
            self.transfer_retry_count += 1;
        }
        self.hold_reason = Some("transfer_failed".to_string());
        self.move_to(TransactionStatus::Held, now);
        self.append_note(
            actor,
            format!(
                "transfer {} failed ({}), attempt {}",
                reference.as_deref().unwrap_or("<none>"),
                reason,
                self.transfer_retry_count
            ),
            now,
        );
        Ok(())
    }

    /// Marks the transaction as part of a payout batch.
    pub fn claim_for_payout(&mut self, now: DateTime<Utc>) -> Result<(), SettlementError> {
        if self.payout_claimed {
            return Err(SettlementError::invalid_transition(
                ENTITY,
                self.id,
                "unclaimed",
                "claimed",
            ));
        }
        if !self.status.is_released_from_hold() && self.actual_release_at.is_none() {
            return Err(SettlementError::invalid_transition(
                ENTITY,
                self.id,
                "released from hold",
                self.status,
            ));
        }
        self.payout_claimed = true;
        self.updated_at = now;
        Ok(())
    }

    pub fn release_payout_claim(&mut self, actor: &str, reason: &str, now: DateTime<Utc>) {
        if self.payout_claimed {
            self.payout_claimed = false;
            self.append_note(actor, format!("payout claim released: {}", reason), now);
        }
    }

    /// Eligible for a new payout batch.
    pub fn is_payout_eligible(&self) -> bool {
        !self.payout_claimed
            && (self.status == TransactionStatus::Released || self.actual_release_at.is_some())
    }
}

pub fn compute_release_date(start: DateTime<Utc>, hold_days: i64) -> DateTime<Utc> {
    start + Duration::days(hold_days)
}
