//! In-memory collaborators shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use bigdecimal::BigDecimal;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Mutex;
use uuid::Uuid;

use settlement_core::domain::money::OrderLine;
use settlement_core::domain::{ExchangeRateSnapshot, TransactionStatus};
use settlement_core::error::SettlementError;
use settlement_core::marketplace::{AmountDue, OrderDirectory, SellerDirectory, VerificationFlags};
use settlement_core::provider::{
    decode_event, BalanceAmount, CheckoutSession, CheckoutSessionRequest, PaymentIntent,
    PaymentProvider, ProviderAccount, ProviderError, ProviderEvent, ProviderPayout, PayoutRequest,
    Refund, RefundRequest, Transfer, TransferRequest, WebhookVerifier,
};
use settlement_core::services::ExchangeRateSource;

pub const WEBHOOK_SECRET: &str = "whsec_test_secret";

pub fn dec(value: &str) -> BigDecimal {
    BigDecimal::from_str(value).unwrap()
}

#[derive(Default)]
pub struct ProviderState {
    pub balances: HashMap<String, Vec<BalanceAmount>>,
    pub payouts_disabled: HashSet<String>,
    pub fail_transfers: bool,
    pub transfers_unreachable: bool,
    pub transfers: Vec<TransferRequest>,
    pub refunds: Vec<RefundRequest>,
    pub payouts: Vec<PayoutRequest>,
    pub checkouts: Vec<CheckoutSessionRequest>,
}

/// Provider fake: idempotency keys map to the same object id, like the
/// real API.
pub struct FakeProvider {
    pub state: Mutex<ProviderState>,
    verifier: WebhookVerifier,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ProviderState::default()),
            verifier: WebhookVerifier::new(WEBHOOK_SECRET, 300),
        }
    }

    pub fn set_balance(&self, account: &str, balances: &[(&str, &str)]) {
        let amounts = balances
            .iter()
            .map(|(currency, amount)| BalanceAmount {
                currency: currency.to_string(),
                amount: dec(amount),
            })
            .collect();
        self.state
            .lock()
            .unwrap()
            .balances
            .insert(account.to_string(), amounts);
    }

    pub fn fail_transfers(&self, fail: bool) {
        self.state.lock().unwrap().fail_transfers = fail;
    }

    pub fn transfers_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().transfers_unreachable = unreachable;
    }

    pub fn transfer_count(&self) -> usize {
        self.state.lock().unwrap().transfers.len()
    }

    pub fn payout_count(&self) -> usize {
        self.state.lock().unwrap().payouts.len()
    }
}

fn object_id(prefix: &str, key: &str) -> String {
    let digest: String = key.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    format!("{}_{}", prefix, digest)
}

#[async_trait]
impl PaymentProvider for FakeProvider {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ProviderError> {
        self.state.lock().unwrap().checkouts.push(request.clone());
        let id = object_id("cs", &request.idempotency_key);
        Ok(CheckoutSession {
            url: Some(format!("https://checkout.test/{}", id)),
            id,
            payment_intent: None,
            payment_status: "unpaid".to_string(),
        })
    }

    async fn create_transfer(&self, request: &TransferRequest) -> Result<Transfer, ProviderError> {
        let mut state = self.state.lock().unwrap();
        if state.transfers_unreachable {
            return Err(ProviderError::ConnectionError("provider unreachable".to_string()));
        }
        if state.fail_transfers {
            return Err(ProviderError::InvalidRequest(
                "balance_insufficient: Insufficient funds".to_string(),
            ));
        }
        state.transfers.push(request.clone());
        Ok(Transfer {
            id: object_id("tr", &request.idempotency_key),
            amount: request.amount.clone(),
            currency: request.currency.clone(),
            destination: Some(request.destination.clone()),
        })
    }

    async fn create_refund(&self, request: &RefundRequest) -> Result<Refund, ProviderError> {
        self.state.lock().unwrap().refunds.push(request.clone());
        Ok(Refund {
            id: object_id("re", &request.idempotency_key),
            status: "pending".to_string(),
            amount: request.amount.clone(),
            currency: request.currency.clone(),
        })
    }

    async fn create_payout(&self, request: &PayoutRequest) -> Result<ProviderPayout, ProviderError> {
        self.state.lock().unwrap().payouts.push(request.clone());
        Ok(ProviderPayout {
            id: object_id("po", &request.idempotency_key),
            status: "pending".to_string(),
            amount: request.amount.clone(),
            currency: request.currency.clone(),
            arrival_date: None,
        })
    }

    async fn retrieve_balance(&self, account: &str) -> Result<Vec<BalanceAmount>, ProviderError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .balances
            .get(account)
            .cloned()
            .unwrap_or_default())
    }

    async fn retrieve_account(&self, account: &str) -> Result<ProviderAccount, ProviderError> {
        let disabled = self.state.lock().unwrap().payouts_disabled.contains(account);
        Ok(ProviderAccount {
            id: account.to_string(),
            charges_enabled: true,
            payouts_enabled: !disabled,
            details_submitted: true,
            requirements_due: Vec::new(),
        })
    }

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, ProviderError> {
        Ok(PaymentIntent {
            id: id.to_string(),
            status: "succeeded".to_string(),
            amount: BigDecimal::from(0),
            currency: "usd".to_string(),
            metadata: HashMap::new(),
        })
    }

    fn verify_webhook(
        &self,
        payload: &[u8],
        signature_header: &str,
    ) -> Result<ProviderEvent, SettlementError> {
        self.verifier
            .verify(payload, signature_header, Utc::now().timestamp())?;
        decode_event(payload)
    }
}

#[derive(Default)]
pub struct MarketplaceState {
    pub delivered: HashSet<Uuid>,
    pub lines: HashMap<Uuid, Vec<OrderLine>>,
    pub destinations: HashMap<Uuid, String>,
    pub notifications: Vec<(Uuid, Uuid, TransactionStatus)>,
}

pub struct FakeMarketplace {
    pub state: Mutex<MarketplaceState>,
}

impl FakeMarketplace {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MarketplaceState::default()),
        }
    }

    pub fn add_order(&self, order_id: Uuid, lines: Vec<OrderLine>) {
        self.state.lock().unwrap().lines.insert(order_id, lines);
    }

    pub fn deliver(&self, order_id: Uuid) {
        self.state.lock().unwrap().delivered.insert(order_id);
    }

    pub fn onboard(&self, seller_id: Uuid, account: &str) {
        self.state
            .lock()
            .unwrap()
            .destinations
            .insert(seller_id, account.to_string());
    }
}

#[async_trait]
impl OrderDirectory for FakeMarketplace {
    async fn is_delivered(&self, order_id: Uuid) -> Result<bool, SettlementError> {
        Ok(self.state.lock().unwrap().delivered.contains(&order_id))
    }

    async fn order_items(&self, order_id: Uuid) -> Result<Vec<OrderLine>, SettlementError> {
        self.state
            .lock()
            .unwrap()
            .lines
            .get(&order_id)
            .cloned()
            .ok_or_else(|| SettlementError::NotFound(format!("order {}", order_id)))
    }

    async fn amount_due(&self, order_id: Uuid) -> Result<AmountDue, SettlementError> {
        let lines = self.order_items(order_id).await?;
        let amount = lines
            .iter()
            .fold(BigDecimal::from(0), |acc, line| {
                acc + &line.unit_price * BigDecimal::from(line.quantity)
            });
        Ok(AmountDue {
            amount,
            currency: lines
                .first()
                .map(|line| line.currency.clone())
                .unwrap_or_else(|| "usd".to_string()),
        })
    }

    async fn notify_settlement_status(
        &self,
        order_id: Uuid,
        seller_id: Uuid,
        status: TransactionStatus,
    ) -> Result<(), SettlementError> {
        self.state
            .lock()
            .unwrap()
            .notifications
            .push((order_id, seller_id, status));
        Ok(())
    }
}

#[async_trait]
impl SellerDirectory for FakeMarketplace {
    async fn payout_destination(&self, seller_id: Uuid) -> Result<Option<String>, SettlementError> {
        Ok(self.state.lock().unwrap().destinations.get(&seller_id).cloned())
    }

    async fn update_verification(
        &self,
        _account_id: &str,
        _flags: &VerificationFlags,
    ) -> Result<(), SettlementError> {
        Ok(())
    }

    async fn seller_for_account(&self, account_id: &str) -> Result<Option<Uuid>, SettlementError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .destinations
            .iter()
            .find(|(_, account)| account.as_str() == account_id)
            .map(|(seller, _)| *seller))
    }
}

#[derive(Default)]
pub struct FakeRates {
    pub snapshots: Mutex<Vec<ExchangeRateSnapshot>>,
}

impl FakeRates {
    pub fn add(&self, snapshot: ExchangeRateSnapshot) {
        self.snapshots.lock().unwrap().push(snapshot);
    }
}

#[async_trait]
impl ExchangeRateSource for FakeRates {
    async fn latest(&self, from: &str, to: &str) -> Result<Option<ExchangeRateSnapshot>, SettlementError> {
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.rate_for(from, to).is_some())
            .max_by_key(|s| s.captured_at)
            .cloned())
    }
}
