//! In-process settlement events, published after a unit of work commits.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::{Payout, PayoutStatus, Transaction, TransactionStatus};
use crate::marketplace::OrderDirectory;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SettlementEvent {
    TransactionStatusChanged {
        transaction_id: Uuid,
        order_id: Uuid,
        seller_id: Uuid,
        from: TransactionStatus,
        to: TransactionStatus,
        at: DateTime<Utc>,
    },
    PayoutStatusChanged {
        payout_id: Uuid,
        seller_id: Uuid,
        from: Option<PayoutStatus>,
        to: PayoutStatus,
        at: DateTime<Utc>,
    },
}

impl SettlementEvent {
    /// Event for a transaction whose status moved away from `from`, if it did.
    pub fn for_transaction(tx: &Transaction, from: TransactionStatus) -> Option<Self> {
        if tx.status() == from {
            return None;
        }
        Some(SettlementEvent::TransactionStatusChanged {
            transaction_id: tx.id,
            order_id: tx.order_id,
            seller_id: tx.seller_id,
            from,
            to: tx.status(),
            at: tx.status_changed_at,
        })
    }

    pub fn for_payout(payout: &Payout, from: Option<PayoutStatus>) -> Self {
        SettlementEvent::PayoutStatusChanged {
            payout_id: payout.id,
            seller_id: payout.seller_id,
            from,
            to: payout.status(),
            at: payout.updated_at,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SettlementEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SettlementEvent> {
        self.sender.subscribe()
    }

    pub fn publish_all(&self, events: Vec<SettlementEvent>) {
        for event in events {
            tracing::debug!(?event, "Publishing settlement event");
            // No subscribers is fine.
            let _ = self.sender.send(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Forwards transaction status changes to the order collaborator. Delivery
/// failures are logged and dropped.
pub fn spawn_order_status_listener(bus: &EventBus, orders: Arc<dyn OrderDirectory>) -> JoinHandle<()> {
    let mut receiver = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match receiver.recv().await {
                Ok(SettlementEvent::TransactionStatusChanged {
                    transaction_id,
                    order_id,
                    seller_id,
                    to,
                    ..
                }) => {
                    if let Err(e) = orders.notify_settlement_status(order_id, seller_id, to).await {
                        tracing::warn!(
                            %transaction_id,
                            %order_id,
                            status = %to,
                            error = %e,
                            "Failed to notify order of settlement status"
                        );
                    }
                }
                Ok(SettlementEvent::PayoutStatusChanged { .. }) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Order status listener lagged behind");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
