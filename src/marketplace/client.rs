use async_trait::async_trait;
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use super::{AmountDue, OrderDirectory, SellerDirectory, VerificationFlags};
use crate::domain::money::OrderLine;
use crate::domain::TransactionStatus;
use crate::error::SettlementError;

#[derive(Error, Debug)]
pub enum MarketplaceError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("Marketplace returned {status}: {body}")]
    UnexpectedStatus { status: StatusCode, body: String },
    #[error("Circuit breaker open: {0}")]
    CircuitBreakerOpen(String),
}

impl From<MarketplaceError> for SettlementError {
    fn from(err: MarketplaceError) -> Self {
        SettlementError::Collaborator(err.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct DeliveryResponse {
    delivered: bool,
}

#[derive(Debug, Deserialize)]
struct DestinationResponse {
    account_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SellerResponse {
    seller_id: Uuid,
}

/// HTTP adapter for the marketplace's order and seller APIs.
#[derive(Clone)]
pub struct MarketplaceClient {
    client: Client,
    base_url: String,
    circuit_breaker: StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>,
}

impl MarketplaceClient {
    pub fn new(base_url: String) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        let backoff = backoff::equal_jittered(Duration::from_secs(30), Duration::from_secs(60));
        let policy = failure_policy::consecutive_failures(5, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        MarketplaceClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            circuit_breaker,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Sends the request through the breaker; a 404 is `Ok(None)`.
    async fn execute(&self, request: RequestBuilder) -> Result<Option<Response>, MarketplaceError> {
        let result = self
            .circuit_breaker
            .call(async move {
                let response = request.send().await?;
                let status = response.status();

                if status == StatusCode::NOT_FOUND {
                    return Ok(None);
                }
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(MarketplaceError::UnexpectedStatus { status, body });
                }
                Ok(Some(response))
            })
            .await;

        match result {
            Ok(response) => Ok(response),
            Err(FailsafeError::Rejected) => Err(MarketplaceError::CircuitBreakerOpen(
                "marketplace circuit breaker is open".to_string(),
            )),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }

    async fn send<T>(&self, request: RequestBuilder) -> Result<Option<T>, MarketplaceError>
    where
        T: DeserializeOwned,
    {
        match self.execute(request).await? {
            Some(response) => Ok(Some(response.json::<T>().await?)),
            None => Ok(None),
        }
    }

    async fn send_required<T>(&self, request: RequestBuilder, what: &str) -> Result<T, SettlementError>
    where
        T: DeserializeOwned,
    {
        self.send(request)
            .await?
            .ok_or_else(|| SettlementError::NotFound(what.to_string()))
    }
}

#[async_trait]
impl OrderDirectory for MarketplaceClient {
    async fn is_delivered(&self, order_id: Uuid) -> Result<bool, SettlementError> {
        let response: DeliveryResponse = self
            .send_required(
                self.client.get(self.url(&format!("/orders/{}/delivery", order_id))),
                &format!("order {}", order_id),
            )
            .await?;
        Ok(response.delivered)
    }

    async fn order_items(&self, order_id: Uuid) -> Result<Vec<OrderLine>, SettlementError> {
        self.send_required(
            self.client.get(self.url(&format!("/orders/{}/items", order_id))),
            &format!("order {}", order_id),
        )
        .await
    }

    async fn amount_due(&self, order_id: Uuid) -> Result<AmountDue, SettlementError> {
        self.send_required(
            self.client.get(self.url(&format!("/orders/{}/amount-due", order_id))),
            &format!("order {}", order_id),
        )
        .await
    }

    async fn notify_settlement_status(
        &self,
        order_id: Uuid,
        seller_id: Uuid,
        status: TransactionStatus,
    ) -> Result<(), SettlementError> {
        let response = self
            .execute(
                self.client
                    .post(self.url(&format!("/orders/{}/settlement-status", order_id)))
                    .json(&json!({ "seller_id": seller_id, "status": status.as_str() })),
            )
            .await?;
        if response.is_none() {
            tracing::warn!(%order_id, "Marketplace does not know order for settlement status");
        }
        Ok(())
    }
}

#[async_trait]
impl SellerDirectory for MarketplaceClient {
    async fn payout_destination(&self, seller_id: Uuid) -> Result<Option<String>, SettlementError> {
        let response: Option<DestinationResponse> = self
            .send(
                self.client
                    .get(self.url(&format!("/sellers/{}/payout-destination", seller_id))),
            )
            .await?;
        Ok(response.and_then(|r| r.account_id))
    }

    async fn update_verification(
        &self,
        account_id: &str,
        flags: &VerificationFlags,
    ) -> Result<(), SettlementError> {
        let response = self
            .execute(
                self.client
                    .put(self.url(&format!("/payment-accounts/{}/verification", account_id)))
                    .json(flags),
            )
            .await?;
        if response.is_none() {
            tracing::warn!(account_id, "Marketplace has no seller for payment account");
        }
        Ok(())
    }

    async fn seller_for_account(&self, account_id: &str) -> Result<Option<Uuid>, SettlementError> {
        let response: Option<SellerResponse> = self
            .send(
                self.client
                    .get(self.url(&format!("/payment-accounts/{}/seller", account_id))),
            )
            .await?;
        Ok(response.map(|r| r.seller_id))
    }
}
