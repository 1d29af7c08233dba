pub mod checkout;
pub mod currency;
pub mod events;
pub mod hold_release;
pub mod payouts;
pub mod transfers;
pub mod webhook_processor;

pub use checkout::{CheckoutOutcome, CheckoutService};
pub use currency::{CurrencyResolution, CurrencyResolver, ExchangeRateSource, PgExchangeRateSource};
pub use events::{spawn_order_status_listener, EventBus, SettlementEvent};
pub use hold_release::{HoldProgress, HoldReleaseManager, SellerHoldSummary};
pub use payouts::{ForceRetryOutcome, PayoutAggregator, PayoutDetails, PayoutStatusUpdate};
pub use transfers::TransferService;
pub use webhook_processor::{WebhookOutcome, WebhookProcessor};

use chrono::Duration;
use sqlx::PgPool;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::Config;
use crate::db::TransactionRunner;
use crate::domain::Transaction;
use crate::error::SettlementError;
use crate::marketplace::{OrderDirectory, SellerDirectory};
use crate::provider::PaymentProvider;

/// Collaborators the settlement services are built from.
#[derive(Clone)]
pub struct Collaborators {
    pub provider: Arc<dyn PaymentProvider>,
    pub orders: Arc<dyn OrderDirectory>,
    pub sellers: Arc<dyn SellerDirectory>,
    pub rates: Arc<dyn ExchangeRateSource>,
}

/// Every settlement service, sharing one pool, retry policy and event bus.
#[derive(Clone)]
pub struct SettlementServices {
    pub runner: TransactionRunner,
    pub events: EventBus,
    pub checkout: CheckoutService,
    pub transfers: TransferService,
    pub holds: HoldReleaseManager,
    pub payouts: PayoutAggregator,
    pub webhooks: WebhookProcessor,
}

impl SettlementServices {
    pub fn new(config: &Config, pool: PgPool, collaborators: Collaborators, events: EventBus) -> Self {
        let runner = TransactionRunner::new(pool, config.retry_policy());
        let Collaborators {
            provider,
            orders,
            sellers,
            rates,
        } = collaborators;

        let checkout = CheckoutService::new(
            runner.clone(),
            provider.clone(),
            orders.clone(),
            config.fee_schedule(),
        );
        let transfers = TransferService::new(
            runner.clone(),
            provider.clone(),
            orders.clone(),
            sellers.clone(),
            events.clone(),
            config.max_transfer_retries,
        );
        let holds = HoldReleaseManager::new(runner.clone(), orders.clone(), transfers.clone());
        let resolver = CurrencyResolver::new(
            provider.clone(),
            rates,
            config.currency_preference.clone(),
            Duration::hours(config.exchange_rate_max_age_hours),
        );
        let payouts = PayoutAggregator::new(
            runner.clone(),
            provider.clone(),
            sellers.clone(),
            resolver,
            holds.clone(),
            events.clone(),
            Duration::hours(config.stuck_payout_hours),
        );
        let webhooks = WebhookProcessor::new(
            runner.clone(),
            provider,
            orders,
            sellers,
            events.clone(),
            config.fee_schedule(),
            config.hold_days,
        );

        Self {
            runner,
            events,
            checkout,
            transfers,
            holds,
            payouts,
            webhooks,
        }
    }

    pub async fn get_transaction(&self, id: Uuid) -> Result<Transaction, SettlementError> {
        transfers::load_transaction(&self.runner, id).await
    }
}
