use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgConnection;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{queries, IsolationLevel, TransactionRunner, TxFailure};
use crate::domain::money::{round_money, split_by_seller, FeeSchedule, OrderLine};
use crate::domain::{NewTransaction, SettlementAmounts, Transaction};
use crate::error::SettlementError;
use crate::marketplace::OrderDirectory;
use crate::provider::{CheckoutSessionRequest, PaymentProvider};

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutOutcome {
    pub session_id: String,
    pub url: Option<String>,
    pub transactions: Vec<Transaction>,
}

/// One pending transaction per seller of the order.
pub(crate) fn transactions_for_order(
    order_id: Uuid,
    buyer_id: Uuid,
    lines: &[OrderLine],
    fees: &FeeSchedule,
    payment_reference: Option<String>,
    now: DateTime<Utc>,
) -> Result<Vec<Transaction>, SettlementError> {
    split_by_seller(lines, fees)?
        .into_iter()
        .map(|share| {
            let amounts = SettlementAmounts::new(share.gross, share.platform_fee, share.provider_fee)?;
            Ok(Transaction::new(
                NewTransaction {
                    order_id,
                    seller_id: share.seller_id,
                    buyer_id,
                    payment_reference: payment_reference.clone(),
                    amounts,
                    currency: share.currency,
                    metadata: serde_json::json!({ "source": "checkout" }),
                },
                now,
            ))
        })
        .collect()
}

/// Inserts the transactions that do not exist yet and returns every
/// transaction of the order, locked.
pub(crate) async fn insert_order_transactions(
    conn: &mut PgConnection,
    order_id: Uuid,
    transactions: &[Transaction],
) -> Result<Vec<Transaction>, TxFailure> {
    for tx in transactions {
        if !queries::insert_transaction_if_absent(conn, tx).await? {
            tracing::debug!(%order_id, seller_id = %tx.seller_id, "Transaction already recorded");
        }
    }
    Ok(queries::lock_transactions_for_order(conn, order_id).await?)
}

#[derive(Clone)]
pub struct CheckoutService {
    runner: TransactionRunner,
    provider: Arc<dyn PaymentProvider>,
    orders: Arc<dyn OrderDirectory>,
    fees: FeeSchedule,
}

impl CheckoutService {
    pub fn new(
        runner: TransactionRunner,
        provider: Arc<dyn PaymentProvider>,
        orders: Arc<dyn OrderDirectory>,
        fees: FeeSchedule,
    ) -> Self {
        Self {
            runner,
            provider,
            orders,
            fees,
        }
    }

    /// Opens a provider checkout for the order and records one pending
    /// transaction per seller.
    pub async fn create_checkout_session(
        &self,
        order_id: Uuid,
        buyer_id: Uuid,
        success_url: &str,
        cancel_url: &str,
    ) -> Result<CheckoutOutcome, SettlementError> {
        let due = self.orders.amount_due(order_id).await?;
        let lines = self.orders.order_items(order_id).await?;
        let now = Utc::now();

        let transactions = transactions_for_order(order_id, buyer_id, &lines, &self.fees, None, now)?;
        let total = round_money(
            &transactions
                .iter()
                .fold(BigDecimal::from(0), |acc, tx| acc + tx.amounts().gross_amount()),
        );
        if total != round_money(&due.amount) {
            return Err(SettlementError::Validation(format!(
                "order {} lines total {} but {} is due",
                order_id, total, due.amount
            )));
        }
        if let Some(tx) = transactions.first() {
            if !tx.currency.eq_ignore_ascii_case(&due.currency) {
                return Err(SettlementError::Validation(format!(
                    "order {} is due in {} but lines are in {}",
                    order_id, due.currency, tx.currency
                )));
            }
        }

        let request = CheckoutSessionRequest {
            amount: total,
            currency: due.currency.to_ascii_lowercase(),
            success_url: success_url.to_string(),
            cancel_url: cancel_url.to_string(),
            idempotency_key: format!("checkout-{}", order_id),
            metadata: HashMap::from([
                ("order_id".to_string(), order_id.to_string()),
                ("buyer_id".to_string(), buyer_id.to_string()),
            ]),
        };
        let session = self
            .provider
            .create_checkout_session(&request)
            .await
            .map_err(SettlementError::from)?;

        let transactions: Vec<Transaction> = transactions
            .into_iter()
            .map(|mut tx| {
                tx.payment_reference = Some(session.id.clone());
                tx
            })
            .collect();
        let recorded = self
            .runner
            .run(IsolationLevel::ReadCommitted, move |conn| {
                let transactions = transactions.clone();
                Box::pin(async move { insert_order_transactions(conn, order_id, &transactions).await })
            })
            .await?;

        tracing::info!(
            %order_id,
            session_id = %session.id,
            sellers = recorded.len(),
            "Checkout session created"
        );
        Ok(CheckoutOutcome {
            session_id: session.id,
            url: session.url,
            transactions: recorded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn fees() -> FeeSchedule {
        FeeSchedule {
            platform_percent: BigDecimal::from(5),
            provider_percent: BigDecimal::from_str("2.9").unwrap(),
            provider_fixed: BigDecimal::from_str("0.30").unwrap(),
        }
    }

    #[test]
    fn builds_one_pending_transaction_per_seller() {
        let seller_a = Uuid::new_v4();
        let seller_b = Uuid::new_v4();
        let lines = vec![
            OrderLine {
                seller_id: seller_a,
                unit_price: BigDecimal::from_str("30.00").unwrap(),
                quantity: 2,
                currency: "USD".to_string(),
            },
            OrderLine {
                seller_id: seller_b,
                unit_price: BigDecimal::from_str("40.00").unwrap(),
                quantity: 1,
                currency: "usd".to_string(),
            },
        ];
        let txs = transactions_for_order(
            Uuid::new_v4(),
            Uuid::new_v4(),
            &lines,
            &fees(),
            Some("cs_1".to_string()),
            Utc::now(),
        )
        .unwrap();

        assert_eq!(txs.len(), 2);
        assert!(txs.iter().all(|tx| tx.status() == crate::domain::TransactionStatus::Pending));
        assert!(txs.iter().all(|tx| tx.currency == "usd"));
        let provider_total = txs
            .iter()
            .fold(BigDecimal::from(0), |acc, tx| acc + tx.amounts().provider_fee());
        assert_eq!(provider_total, BigDecimal::from_str("3.20").unwrap());
    }

    #[test]
    fn single_seller_matches_reference_fees() {
        let lines = vec![OrderLine {
            seller_id: Uuid::new_v4(),
            unit_price: BigDecimal::from_str("100.00").unwrap(),
            quantity: 1,
            currency: "usd".to_string(),
        }];
        let txs = transactions_for_order(Uuid::new_v4(), Uuid::new_v4(), &lines, &fees(), None, Utc::now())
            .unwrap();
        assert_eq!(txs[0].net_amount(), &BigDecimal::from_str("91.80").unwrap());
    }
}
