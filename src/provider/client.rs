use async_trait::async_trait;
use chrono::Utc;
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use super::events::{decode_event, ProviderEvent};
use super::signature::WebhookVerifier;
use super::types::*;
use super::{PaymentProvider, ProviderError};
use crate::domain::money::{from_minor_units, to_minor_units};
use crate::error::SettlementError;

type Breaker = StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>;

#[derive(Debug, Deserialize)]
struct StripeCheckoutSession {
    id: String,
    url: Option<String>,
    payment_intent: Option<String>,
    #[serde(default)]
    payment_status: String,
}

#[derive(Debug, Deserialize)]
struct StripeTransfer {
    id: String,
    amount: i64,
    currency: String,
    destination: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StripeRefund {
    id: String,
    #[serde(default)]
    status: String,
    amount: i64,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct StripePayout {
    id: String,
    status: String,
    amount: i64,
    currency: String,
    arrival_date: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct StripeBalance {
    available: Vec<StripeBalanceAmount>,
}

#[derive(Debug, Deserialize)]
struct StripeBalanceAmount {
    amount: i64,
    currency: String,
}

#[derive(Debug, Default, Deserialize)]
struct StripeRequirements {
    #[serde(default)]
    currently_due: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct StripeAccount {
    id: String,
    #[serde(default)]
    charges_enabled: bool,
    #[serde(default)]
    payouts_enabled: bool,
    #[serde(default)]
    details_submitted: bool,
    #[serde(default)]
    requirements: Option<StripeRequirements>,
}

#[derive(Debug, Deserialize)]
struct StripePaymentIntent {
    id: String,
    status: String,
    amount: i64,
    currency: String,
    #[serde(default)]
    metadata: Metadata,
}

#[derive(Debug, Deserialize)]
struct StripeErrorBody {
    error: StripeErrorDetail,
}

#[derive(Debug, Deserialize)]
struct StripeErrorDetail {
    message: Option<String>,
    code: Option<String>,
}

/// HTTP client for the payment provider's REST API, guarded by a circuit
/// breaker that only counts connection-level failures.
#[derive(Clone)]
pub struct StripeClient {
    client: Client,
    base_url: String,
    api_key: String,
    verifier: WebhookVerifier,
    circuit_breaker: Breaker,
}

impl StripeClient {
    pub fn new(base_url: String, api_key: String, verifier: WebhookVerifier) -> Self {
        Self::with_circuit_breaker(base_url, api_key, verifier, 5, 30)
    }

    pub fn with_circuit_breaker(
        base_url: String,
        api_key: String,
        verifier: WebhookVerifier,
        failure_threshold: u32,
        reset_timeout_secs: u64,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();

        let backoff = backoff::equal_jittered(
            Duration::from_secs(reset_timeout_secs),
            Duration::from_secs(reset_timeout_secs * 2),
        );
        let policy = failure_policy::consecutive_failures(failure_threshold, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        StripeClient {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            verifier,
            circuit_breaker,
        }
    }

    /// Returns the current state of the circuit breaker
    pub fn circuit_state(&self) -> &'static str {
        if self.circuit_breaker.is_call_permitted() {
            "closed"
        } else {
            "open"
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn post(&self, path: &str, idempotency_key: &str) -> RequestBuilder {
        self.client
            .post(self.url(path))
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", idempotency_key)
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client.get(self.url(path)).bearer_auth(&self.api_key)
    }

    async fn send<T>(&self, request: RequestBuilder) -> Result<T, ProviderError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let result = self
            .circuit_breaker
            .call_with(is_transient_failure, async move {
                let response = request
                    .send()
                    .await
                    .map_err(|e| ProviderError::ConnectionError(e.to_string()))?;
                let status = response.status();

                if status.is_success() {
                    return response.json::<T>().await.map_err(|e| {
                        ProviderError::ConnectionError(format!("unreadable response: {}", e))
                    });
                }

                let body = response.text().await.unwrap_or_default();
                let message = error_message(&body)
                    .unwrap_or_else(|| format!("provider returned {}", status));
                if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
                    Err(ProviderError::InvalidRequest(message))
                } else {
                    Err(ProviderError::ConnectionError(message))
                }
            })
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(FailsafeError::Rejected) => Err(ProviderError::ConnectionError(
                "provider circuit breaker is open".to_string(),
            )),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }
}

fn is_transient_failure(err: &ProviderError) -> bool {
    err.is_transient()
}

fn error_message(body: &str) -> Option<String> {
    let parsed: StripeErrorBody = serde_json::from_str(body).ok()?;
    match (parsed.error.code, parsed.error.message) {
        (Some(code), Some(message)) => Some(format!("{}: {}", code, message)),
        (None, Some(message)) => Some(message),
        (Some(code), None) => Some(code),
        (None, None) => None,
    }
}

fn minor_units(amount: &bigdecimal::BigDecimal, currency: &str) -> Result<String, ProviderError> {
    to_minor_units(amount, currency)
        .map(|units| units.to_string())
        .map_err(|e| ProviderError::InvalidRequest(e.to_string()))
}

fn with_metadata(
    mut form: Vec<(String, String)>,
    prefix: &str,
    metadata: &Metadata,
) -> Vec<(String, String)> {
    let mut keys: Vec<_> = metadata.keys().collect();
    keys.sort();
    for key in keys {
        form.push((format!("{}[{}]", prefix, key), metadata[key].clone()));
    }
    form
}

#[async_trait]
impl PaymentProvider for StripeClient {
    async fn create_checkout_session(
        &self,
        request: &CheckoutSessionRequest,
    ) -> Result<CheckoutSession, ProviderError> {
        let form = vec![
            ("mode".to_string(), "payment".to_string()),
            ("success_url".to_string(), request.success_url.clone()),
            ("cancel_url".to_string(), request.cancel_url.clone()),
            (
                "line_items[0][price_data][currency]".to_string(),
                request.currency.clone(),
            ),
            (
                "line_items[0][price_data][unit_amount]".to_string(),
                minor_units(&request.amount, &request.currency)?,
            ),
            (
                "line_items[0][price_data][product_data][name]".to_string(),
                "Marketplace order".to_string(),
            ),
            ("line_items[0][quantity]".to_string(), "1".to_string()),
        ];
        let form = with_metadata(form, "metadata", &request.metadata);
        let form = with_metadata(form, "payment_intent_data[metadata]", &request.metadata);

        let session: StripeCheckoutSession = self
            .send(
                self.post("/v1/checkout/sessions", &request.idempotency_key)
                    .form(&form),
            )
            .await?;

        Ok(CheckoutSession {
            id: session.id,
            url: session.url,
            payment_intent: session.payment_intent,
            payment_status: session.payment_status,
        })
    }

    async fn create_transfer(&self, request: &TransferRequest) -> Result<Transfer, ProviderError> {
        let form = vec![
            ("amount".to_string(), minor_units(&request.amount, &request.currency)?),
            ("currency".to_string(), request.currency.clone()),
            ("destination".to_string(), request.destination.clone()),
        ];
        let form = with_metadata(form, "metadata", &request.metadata);

        let transfer: StripeTransfer = self
            .send(self.post("/v1/transfers", &request.idempotency_key).form(&form))
            .await?;

        Ok(Transfer {
            amount: from_minor_units(transfer.amount, &transfer.currency),
            id: transfer.id,
            currency: transfer.currency,
            destination: transfer.destination,
        })
    }

    async fn create_refund(&self, request: &RefundRequest) -> Result<Refund, ProviderError> {
        let mut metadata = request.metadata.clone();
        if let Some(reason) = &request.reason {
            metadata.insert("reason".to_string(), reason.clone());
        }
        let form = vec![
            ("payment_intent".to_string(), request.payment_intent.clone()),
            ("amount".to_string(), minor_units(&request.amount, &request.currency)?),
        ];
        let form = with_metadata(form, "metadata", &metadata);

        let refund: StripeRefund = self
            .send(self.post("/v1/refunds", &request.idempotency_key).form(&form))
            .await?;

        Ok(Refund {
            amount: from_minor_units(refund.amount, &refund.currency),
            id: refund.id,
            status: refund.status,
            currency: refund.currency,
        })
    }

    async fn create_payout(&self, request: &PayoutRequest) -> Result<ProviderPayout, ProviderError> {
        let form = vec![
            ("amount".to_string(), minor_units(&request.amount, &request.currency)?),
            ("currency".to_string(), request.currency.clone()),
        ];
        let form = with_metadata(form, "metadata", &request.metadata);

        let payout: StripePayout = self
            .send(
                self.post("/v1/payouts", &request.idempotency_key)
                    .header("Stripe-Account", &request.account)
                    .form(&form),
            )
            .await?;

        Ok(ProviderPayout {
            amount: from_minor_units(payout.amount, &payout.currency),
            id: payout.id,
            status: payout.status,
            currency: payout.currency,
            arrival_date: payout.arrival_date,
        })
    }

    async fn retrieve_balance(&self, account: &str) -> Result<Vec<BalanceAmount>, ProviderError> {
        let balance: StripeBalance = self
            .send(self.get("/v1/balance").header("Stripe-Account", account))
            .await?;

        Ok(balance
            .available
            .into_iter()
            .map(|entry| BalanceAmount {
                amount: from_minor_units(entry.amount, &entry.currency),
                currency: entry.currency.to_ascii_lowercase(),
            })
            .collect())
    }

    async fn retrieve_account(&self, account: &str) -> Result<ProviderAccount, ProviderError> {
        let account: StripeAccount = self.send(self.get(&format!("/v1/accounts/{}", account))).await?;

        Ok(ProviderAccount {
            id: account.id,
            charges_enabled: account.charges_enabled,
            payouts_enabled: account.payouts_enabled,
            details_submitted: account.details_submitted,
            requirements_due: account
                .requirements
                .map(|r| r.currently_due)
                .unwrap_or_default(),
        })
    }

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, ProviderError> {
        let intent: StripePaymentIntent = self
            .send(self.get(&format!("/v1/payment_intents/{}", id)))
            .await?;

        Ok(PaymentIntent {
            amount: from_minor_units(intent.amount, &intent.currency),
            id: intent.id,
            status: intent.status,
            currency: intent.currency,
            metadata: intent.metadata,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation_trims_base_url() {
        let client = StripeClient::new(
            "https://api.stripe.com/".to_string(),
            "sk_test".to_string(),
            WebhookVerifier::new("whsec", 300),
        );
        assert_eq!(client.url("/v1/balance"), "https://api.stripe.com/v1/balance");
        assert_eq!(client.circuit_state(), "closed");
    }

    #[test]
    fn test_error_message_extraction() {
        let body = r#"{"error":{"code":"balance_insufficient","message":"Insufficient funds"}}"#;
        assert_eq!(
            error_message(body).as_deref(),
            Some("balance_insufficient: Insufficient funds")
        );
        assert_eq!(error_message("<html>"), None);
    }

    #[test]
    fn test_metadata_is_form_encoded_in_key_order() {
        let metadata = Metadata::from([
            ("transaction_id".to_string(), "t1".to_string()),
            ("order_id".to_string(), "o1".to_string()),
        ]);
        let form = with_metadata(Vec::new(), "metadata", &metadata);
        assert_eq!(
            form,
            vec![
                ("metadata[order_id]".to_string(), "o1".to_string()),
                ("metadata[transaction_id]".to_string(), "t1".to_string()),
            ]
        );
    }
}
