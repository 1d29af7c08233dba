//! End-to-end settlement flows against Postgres. Skipped without DATABASE_URL.

mod common;

use chrono::{Duration, Utc};
use serde_json::json;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use common::{dec, FakeMarketplace, FakeProvider, FakeRates, WEBHOOK_SECRET};
use settlement_core::config::Config;
use settlement_core::db;
use settlement_core::domain::money::OrderLine;
use settlement_core::domain::{
    Payout, PayoutItemStatus, PayoutStatus, ReconciliationStatus, TransactionStatus,
};
use settlement_core::provider::signature::sign_payload;
use settlement_core::services::{Collaborators, EventBus, SettlementServices, WebhookOutcome};

struct Harness {
    pool: PgPool,
    services: SettlementServices,
    provider: Arc<FakeProvider>,
    marketplace: Arc<FakeMarketplace>,
}

async fn harness() -> Option<Harness> {
    let database_url = match std::env::var("DATABASE_URL") {
        Ok(v) => v,
        Err(_) => {
            println!("Skipping settlement scenario: DATABASE_URL not set");
            return None;
        }
    };

    let vars = HashMap::from([
        ("DATABASE_URL", database_url),
        ("PROVIDER_API_KEY", "sk_test_123456".to_string()),
        ("PROVIDER_WEBHOOK_SECRET", WEBHOOK_SECRET.to_string()),
        ("MARKETPLACE_API_URL", "http://marketplace.local".to_string()),
        ("ADMIN_API_KEY", "admin-key".to_string()),
    ]);
    let config = Config::from_lookup(|key| vars.get(key).cloned()).unwrap();
    let pool = db::create_pool(&config).await.expect("Failed to connect to test DB");
    db::run_migrations(&pool).await.expect("Failed to run migrations");

    let provider = Arc::new(FakeProvider::new());
    let marketplace = Arc::new(FakeMarketplace::new());
    let collaborators = Collaborators {
        provider: provider.clone(),
        orders: marketplace.clone(),
        sellers: marketplace.clone(),
        rates: Arc::new(FakeRates::default()),
    };
    let services = SettlementServices::new(&config, pool.clone(), collaborators, EventBus::new(64));

    Some(Harness {
        pool,
        services,
        provider,
        marketplace,
    })
}

struct Order {
    order_id: Uuid,
    buyer_id: Uuid,
    seller_id: Uuid,
    account: String,
}

impl Harness {
    fn order(&self) -> Order {
        let order = Order {
            order_id: Uuid::new_v4(),
            buyer_id: Uuid::new_v4(),
            seller_id: Uuid::new_v4(),
            account: format!("acct_{}", Uuid::new_v4().simple()),
        };
        self.marketplace.add_order(
            order.order_id,
            vec![OrderLine {
                seller_id: order.seller_id,
                unit_price: dec("50.00"),
                quantity: 2,
                currency: "usd".to_string(),
            }],
        );
        self.marketplace.onboard(order.seller_id, &order.account);
        self.provider.set_balance(&order.account, &[("usd", "1000.00")]);
        order
    }

    async fn deliver(&self, payload: serde_json::Value) -> WebhookOutcome {
        let body = payload.to_string();
        let signature = sign_payload(body.as_bytes(), WEBHOOK_SECRET, Utc::now().timestamp()).unwrap();
        self.services
            .webhooks
            .handle_raw(body.as_bytes(), &signature, Some("test-client"))
            .await
            .unwrap()
    }

    /// Checkout through to `held`; returns the transaction id.
    async fn held_transaction(&self, order: &Order) -> Uuid {
        let outcome = self
            .services
            .checkout
            .create_checkout_session(
                order.order_id,
                order.buyer_id,
                "https://shop.example/ok",
                "https://shop.example/cancel",
            )
            .await
            .unwrap();
        let result = self.deliver(checkout_event(order, &outcome.session_id)).await;
        assert_eq!(result, WebhookOutcome::Processed);
        outcome.transactions[0].id
    }

    async fn expire_hold(&self, transaction_id: Uuid) {
        sqlx::query("UPDATE transactions SET planned_release_at = $2 WHERE id = $1")
            .bind(transaction_id)
            .bind(Utc::now() - Duration::days(1))
            .execute(&self.pool)
            .await
            .unwrap();
    }
}

fn checkout_event(order: &Order, session_id: &str) -> serde_json::Value {
    json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": "checkout.session.completed",
        "created": Utc::now().timestamp(),
        "data": { "object": {
            "id": session_id,
            "payment_intent": format!("pi_{}", order.order_id.simple()),
            "payment_status": "paid",
            "amount_total": 10000,
            "currency": "usd",
            "metadata": {
                "order_id": order.order_id.to_string(),
                "buyer_id": order.buyer_id.to_string()
            }
        }}
    })
}

fn payout_event(event_type: &str, payout: &Payout, status: &str, seller_id: Uuid) -> serde_json::Value {
    let mut object = json!({
        "id": payout.provider_payout_id.clone().unwrap(),
        "amount": 9180,
        "currency": "usd",
        "status": status,
        "metadata": { "payout_id": payout.id.to_string(), "seller_id": seller_id.to_string() }
    });
    if status == "failed" {
        object["failure_code"] = json!("account_closed");
        object["failure_message"] = json!("The bank account has been closed");
    }
    json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": event_type,
        "created": Utc::now().timestamp(),
        "data": { "object": object }
    })
}

/// Payouts that are neither failed nor canceled and list the transaction.
async fn live_payouts_holding(pool: &PgPool, transaction_id: Uuid) -> i64 {
    sqlx::query_scalar(
        r#"
        SELECT COUNT(DISTINCT p.id) FROM payout_items pi
        JOIN payouts p ON p.id = pi.payout_id
        WHERE pi.transaction_id = $1 AND p.status NOT IN ('failed', 'canceled')
        "#,
    )
    .bind(transaction_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

/// Delivered, past its hold and batched into one pending payout.
async fn batched_transaction(h: &Harness, order: &Order) -> (Uuid, Payout) {
    let id = h.held_transaction(order).await;
    h.marketplace.deliver(order.order_id);
    h.expire_hold(id).await;
    let mut payouts = h.services.payouts.create_payout(order.seller_id).await.unwrap();
    assert_eq!(payouts.len(), 1);
    (id, payouts.remove(0))
}

#[tokio::test]
async fn test_checkout_completed_holds_funds() {
    let Some(h) = harness().await else { return };
    let order = h.order();

    let id = h.held_transaction(&order).await;
    let tx = h.services.get_transaction(id).await.unwrap();

    assert_eq!(tx.status(), TransactionStatus::Held);
    assert_eq!(tx.amounts().gross_amount(), &dec("100.00"));
    assert_eq!(tx.amounts().platform_fee(), &dec("5.00"));
    assert_eq!(tx.amounts().provider_fee(), &dec("3.20"));
    assert_eq!(tx.net_amount(), &dec("91.80"));

    let planned = tx.planned_release_at.unwrap();
    let expected = Utc::now() + Duration::days(30);
    assert!((planned - expected).num_minutes().abs() < 5);
}

#[tokio::test]
async fn test_duplicate_webhook_delivery_is_skipped() {
    let Some(h) = harness().await else { return };
    let order = h.order();
    let outcome = h
        .services
        .checkout
        .create_checkout_session(order.order_id, order.buyer_id, "https://a.example", "https://b.example")
        .await
        .unwrap();
    let event = checkout_event(&order, &outcome.session_id);

    let event_id = event["id"].as_str().unwrap().to_string();

    assert_eq!(h.deliver(event.clone()).await, WebhookOutcome::Processed);
    let planned = h
        .services
        .get_transaction(outcome.transactions[0].id)
        .await
        .unwrap()
        .planned_release_at;
    assert_eq!(h.deliver(event).await, WebhookOutcome::Duplicate);

    let processed: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM webhook_events WHERE external_event_id = $1 AND status = 'processed'",
    )
    .bind(&event_id)
    .fetch_one(&h.pool)
    .await
    .unwrap();
    assert_eq!(processed, 1);

    // The provider may also resend the same checkout under a new event id.
    let resent = checkout_event(&order, &outcome.session_id);
    assert_eq!(h.deliver(resent).await, WebhookOutcome::Processed);

    let tx = h.services.get_transaction(outcome.transactions[0].id).await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::Held);
    assert!(planned.is_some());
    assert_eq!(tx.planned_release_at, planned);
}

#[tokio::test]
async fn test_payout_transfer_and_failure_flow() {
    let Some(h) = harness().await else { return };
    let order = h.order();
    let id = h.held_transaction(&order).await;
    h.marketplace.deliver(order.order_id);
    h.expire_hold(id).await;

    let payouts = h.services.payouts.create_payout(order.seller_id).await.unwrap();
    assert_eq!(payouts.len(), 1);
    let payout = &payouts[0];
    assert_eq!(payout.status(), PayoutStatus::Pending);
    assert_eq!(payout.total_amount, dec("91.80"));

    let details = h.services.payouts.get_payout(payout.id).await.unwrap();
    assert_eq!(details.items.len(), 1);
    assert_eq!(details.items[0].transaction_id, id);
    assert_eq!(details.items[0].amount, dec("91.80"));

    let tx = h.services.get_transaction(id).await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::Processing);
    assert!(tx.payout_claimed());
    let transfer_id = tx.transfer_reference.clone().unwrap();

    let transfer_event = json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": "transfer.created",
        "created": Utc::now().timestamp(),
        "data": { "object": {
            "id": transfer_id,
            "amount": 9180,
            "currency": "usd",
            "destination": order.account,
            "metadata": { "transaction_id": id.to_string() }
        }}
    });
    assert_eq!(h.deliver(transfer_event).await, WebhookOutcome::Processed);

    let tx = h.services.get_transaction(id).await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::Released);
    let details = h.services.payouts.get_payout(payout.id).await.unwrap();
    assert_eq!(details.items[0].status, PayoutItemStatus::Paid);

    let failed_event = json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": "payout.failed",
        "created": Utc::now().timestamp(),
        "data": { "object": {
            "id": payout.provider_payout_id.clone().unwrap(),
            "amount": 9180,
            "currency": "usd",
            "status": "failed",
            "failure_code": "account_closed",
            "failure_message": "The bank account has been closed",
            "metadata": { "payout_id": payout.id.to_string(), "seller_id": order.seller_id.to_string() }
        }}
    });
    assert_eq!(h.deliver(failed_event).await, WebhookOutcome::Processed);

    let details = h.services.payouts.get_payout(payout.id).await.unwrap();
    assert_eq!(details.payout.status(), PayoutStatus::Failed);
    assert_eq!(details.payout.failure_code.as_deref(), Some("account_closed"));

    let tx = h.services.get_transaction(id).await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::Released);
    assert!(!tx.payout_claimed());

    let eligible = h
        .services
        .payouts
        .select_eligible_transactions(order.seller_id)
        .await
        .unwrap();
    assert!(eligible.iter().any(|candidate| candidate.id == id));
    assert_eq!(details.items.len(), 1);
}

#[tokio::test]
async fn test_create_payout_twice_does_not_double_batch() {
    let Some(h) = harness().await else { return };
    let order = h.order();
    let id = h.held_transaction(&order).await;
    h.marketplace.deliver(order.order_id);
    h.expire_hold(id).await;

    let first = h.services.payouts.create_payout(order.seller_id).await.unwrap();
    let second = h.services.payouts.create_payout(order.seller_id).await.unwrap();

    assert_eq!(first.len(), 1);
    assert!(second.is_empty());
    assert_eq!(h.provider.transfer_count(), 1);
}

#[tokio::test]
async fn test_refund_failure_needs_manual_review() {
    let Some(h) = harness().await else { return };
    let order = h.order();
    let id = h.held_transaction(&order).await;

    let tx = h
        .services
        .transfers
        .request_refund(id, None, "item damaged", "ops@example.com")
        .await
        .unwrap();
    assert_eq!(tx.status(), TransactionStatus::WaitingRefund);
    let refund_id = tx.refund_reference.clone().unwrap();

    let refund_failed = json!({
        "id": format!("evt_{}", Uuid::new_v4().simple()),
        "type": "refund.failed",
        "created": Utc::now().timestamp(),
        "data": { "object": {
            "id": refund_id,
            "status": "failed",
            "amount": 10000,
            "currency": "usd",
            "failure_reason": "expired_or_canceled_card",
            "metadata": { "transaction_id": id.to_string() }
        }}
    });
    assert_eq!(h.deliver(refund_failed).await, WebhookOutcome::Processed);

    let tx = h.services.get_transaction(id).await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::FailedRefund);

    let payouts = h.services.payouts.create_payout(order.seller_id).await.unwrap();
    assert!(payouts.is_empty());
    let tx = h.services.get_transaction(id).await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::FailedRefund);
}

#[tokio::test]
async fn test_concurrent_transfer_initiation_moves_funds_once() {
    let Some(h) = harness().await else { return };
    let order = h.order();
    let id = h.held_transaction(&order).await;
    h.marketplace.deliver(order.order_id);
    h.expire_hold(id).await;

    let first = h.services.transfers.clone();
    let second = h.services.transfers.clone();
    let (a, b) = tokio::join!(
        first.initiate_transfer(id, false, "ops-a", None),
        second.initiate_transfer(id, false, "ops-b", None),
    );

    assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
    assert_eq!(h.provider.transfer_count(), 1);
    let tx = h.services.get_transaction(id).await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::Processing);
}

#[tokio::test]
async fn test_transfer_before_delivery_is_refused() {
    let Some(h) = harness().await else { return };
    let order = h.order();
    let id = h.held_transaction(&order).await;
    h.expire_hold(id).await;

    let err = h
        .services
        .transfers
        .initiate_transfer(id, true, "ops", None)
        .await
        .unwrap_err();

    assert!(err.to_string().contains("transfer guard"));
    assert_eq!(h.provider.transfer_count(), 0);
}

#[tokio::test]
async fn test_provider_failure_rolls_transfer_back_to_held() {
    let Some(h) = harness().await else { return };
    let order = h.order();
    let id = h.held_transaction(&order).await;
    h.marketplace.deliver(order.order_id);
    h.expire_hold(id).await;
    h.provider.fail_transfers(true);

    assert!(h.services.transfers.initiate_transfer(id, false, "ops", None).await.is_err());

    let tx = h.services.get_transaction(id).await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::Held);
    assert_eq!(tx.transfer_retry_count, 1);
}

#[tokio::test]
async fn test_unreachable_provider_does_not_spend_a_retry() {
    let Some(h) = harness().await else { return };
    let order = h.order();
    let id = h.held_transaction(&order).await;
    h.marketplace.deliver(order.order_id);
    h.expire_hold(id).await;
    h.provider.transfers_unreachable(true);

    assert!(h.services.transfers.initiate_transfer(id, false, "ops", None).await.is_err());

    let tx = h.services.get_transaction(id).await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::Held);
    assert_eq!(tx.transfer_retry_count, 0);

    h.provider.transfers_unreachable(false);
    let tx = h.services.transfers.initiate_transfer(id, false, "ops", None).await.unwrap();
    assert_eq!(tx.status(), TransactionStatus::Processing);
    let sent = h.provider.state.lock().unwrap().transfers[0].idempotency_key.clone();
    assert_eq!(sent, format!("transfer-{}-0", id));
}

#[tokio::test]
async fn test_force_retry_of_failed_payout_batches_again() {
    let Some(h) = harness().await else { return };
    let order = h.order();
    let (id, payout) = batched_transaction(&h, &order).await;

    let failed = payout_event("payout.failed", &payout, "failed", order.seller_id);
    assert_eq!(h.deliver(failed).await, WebhookOutcome::Processed);

    let outcome = h
        .services
        .payouts
        .force_retry_payout(payout.id, "ops@example.com")
        .await
        .unwrap();

    assert_eq!(outcome.previous.status(), PayoutStatus::Failed);
    assert_eq!(outcome.previous.retry_count, 1);
    assert_eq!(outcome.created.len(), 1);
    assert_ne!(outcome.created[0].id, payout.id);
    assert_eq!(h.provider.payout_count(), 2);
    assert_eq!(live_payouts_holding(&h.pool, id).await, 1);
    assert!(h.services.get_transaction(id).await.unwrap().payout_claimed());
}

#[tokio::test]
async fn test_force_retry_leaves_claim_of_newer_payout() {
    let Some(h) = harness().await else { return };
    let order = h.order();
    let (id, first) = batched_transaction(&h, &order).await;

    let failed = payout_event("payout.failed", &first, "failed", order.seller_id);
    assert_eq!(h.deliver(failed).await, WebhookOutcome::Processed);
    let second = h.services.payouts.create_payout(order.seller_id).await.unwrap();
    assert_eq!(second.len(), 1);

    let outcome = h
        .services
        .payouts
        .force_retry_payout(first.id, "ops@example.com")
        .await
        .unwrap();

    assert!(outcome.created.is_empty());
    assert_eq!(h.provider.payout_count(), 2);
    assert_eq!(live_payouts_holding(&h.pool, id).await, 1);
    assert!(h.services.get_transaction(id).await.unwrap().payout_claimed());
}

#[tokio::test]
async fn test_force_retry_refuses_live_payout() {
    let Some(h) = harness().await else { return };
    let order = h.order();
    let (_, payout) = batched_transaction(&h, &order).await;

    let err = h
        .services
        .payouts
        .force_retry_payout(payout.id, "ops@example.com")
        .await
        .unwrap_err();

    assert!(err.to_string().contains("stuck pending"));
    assert_eq!(h.provider.payout_count(), 1);
}

#[tokio::test]
async fn test_out_of_order_payout_status_is_ignored() {
    let Some(h) = harness().await else { return };
    let order = h.order();
    let (id, payout) = batched_transaction(&h, &order).await;

    let paid = payout_event("payout.paid", &payout, "paid", order.seller_id);
    assert_eq!(h.deliver(paid).await, WebhookOutcome::Processed);
    let late = payout_event("payout.updated", &payout, "in_transit", order.seller_id);
    assert_eq!(h.deliver(late).await, WebhookOutcome::Processed);

    let details = h.services.payouts.get_payout(payout.id).await.unwrap();
    assert_eq!(details.payout.status(), PayoutStatus::Paid);
    assert_eq!(details.payout.reconciliation_status, ReconciliationStatus::Unreconciled);
    assert!(h.services.get_transaction(id).await.unwrap().payout_claimed());
}

#[tokio::test]
async fn test_reconcile_payout_records_operator_decision() {
    let Some(h) = harness().await else { return };
    let order = h.order();
    let (id, payout) = batched_transaction(&h, &order).await;

    let reconciled = h
        .services
        .payouts
        .reconcile_payout(
            payout.id,
            ReconciliationStatus::Reconciled,
            Some(PayoutStatus::Paid),
            Some("matched bank statement".to_string()),
            "ops@example.com",
        )
        .await
        .unwrap();
    assert_eq!(reconciled.status(), PayoutStatus::Paid);
    assert_eq!(reconciled.reconciliation_status, ReconciliationStatus::Reconciled);

    let canceled = h
        .services
        .payouts
        .reconcile_payout(
            payout.id,
            ReconciliationStatus::Discrepancy,
            Some(PayoutStatus::Canceled),
            None,
            "ops@example.com",
        )
        .await
        .unwrap();
    assert_eq!(canceled.status(), PayoutStatus::Paid);
    assert_eq!(canceled.reconciliation_status, ReconciliationStatus::Discrepancy);
    assert!(h.services.get_transaction(id).await.unwrap().payout_claimed());
}
