//! Funding currency selection.
//!
//! Given an amount owed in a preferred currency and the account that pays it,
//! picks the currency to actually move. The preferred currency wins whenever
//! its balance covers the amount; otherwise the other balances are tried in
//! order, converting through the latest stored exchange rate. There is no
//! fallback rate: missing or stale data is a hard failure.

use async_trait::async_trait;
use bigdecimal::{BigDecimal, One, Zero};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::sync::Arc;

use crate::db::queries;
use crate::domain::money::round_money;
use crate::domain::ExchangeRateSnapshot;
use crate::error::SettlementError;
use crate::provider::{BalanceAmount, PaymentProvider};

#[async_trait]
pub trait ExchangeRateSource: Send + Sync {
    /// Latest snapshot for the pair, stored in either direction.
    async fn latest(&self, from: &str, to: &str) -> Result<Option<ExchangeRateSnapshot>, SettlementError>;
}

#[derive(Clone)]
pub struct PgExchangeRateSource {
    pool: PgPool,
}

impl PgExchangeRateSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExchangeRateSource for PgExchangeRateSource {
    async fn latest(&self, from: &str, to: &str) -> Result<Option<ExchangeRateSnapshot>, SettlementError> {
        let mut conn = self.pool.acquire().await?;
        queries::latest_exchange_rate(&mut conn, from, to).await
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrencyResolution {
    pub currency: String,
    pub amount: BigDecimal,
    pub converted: bool,
    pub rate: BigDecimal,
}

#[derive(Clone)]
pub struct CurrencyResolver {
    provider: Arc<dyn PaymentProvider>,
    rates: Arc<dyn ExchangeRateSource>,
    preference: Vec<String>,
    max_age: Duration,
}

/// Sorts balances by amount (largest first), ties broken by preference
/// order; currencies absent from the preference list sort last.
pub fn order_balances(mut balances: Vec<BalanceAmount>, preference: &[String]) -> Vec<BalanceAmount> {
    let rank = |currency: &str| {
        preference
            .iter()
            .position(|p| p == currency)
            .unwrap_or(preference.len())
    };
    balances.sort_by(|a, b| {
        b.amount
            .cmp(&a.amount)
            .then_with(|| rank(&a.currency).cmp(&rank(&b.currency)))
    });
    balances
}

impl CurrencyResolver {
    pub fn new(
        provider: Arc<dyn PaymentProvider>,
        rates: Arc<dyn ExchangeRateSource>,
        preference: Vec<String>,
        max_age: Duration,
    ) -> Self {
        Self {
            provider,
            rates,
            preference,
            max_age,
        }
    }

    pub async fn resolve(
        &self,
        preferred_currency: &str,
        required_amount: &BigDecimal,
        funding_target: &str,
        now: DateTime<Utc>,
    ) -> Result<CurrencyResolution, SettlementError> {
        let preferred = preferred_currency.to_ascii_lowercase();
        let balances = self
            .provider
            .retrieve_balance(funding_target)
            .await
            .map_err(SettlementError::from)?;
        let balances = order_balances(
            balances
                .into_iter()
                .map(|b| BalanceAmount {
                    currency: b.currency.to_ascii_lowercase(),
                    amount: b.amount,
                })
                .collect(),
            &self.preference,
        );

        if balances
            .iter()
            .any(|b| b.currency == preferred && &b.amount >= required_amount)
        {
            return Ok(CurrencyResolution {
                currency: preferred,
                amount: required_amount.clone(),
                converted: false,
                rate: BigDecimal::one(),
            });
        }

        let mut rate_failure: Option<SettlementError> = None;
        for balance in balances.iter().filter(|b| b.currency != preferred) {
            if balance.amount <= BigDecimal::zero() {
                continue;
            }
            let rate = match self.fresh_rate(&preferred, &balance.currency, now).await {
                Ok(rate) => rate,
                Err(err @ SettlementError::ExchangeRateUnavailable { .. }) => {
                    tracing::warn!(
                        from = %preferred,
                        to = %balance.currency,
                        error = %err,
                        "Skipping funding currency without usable rate"
                    );
                    rate_failure.get_or_insert(err);
                    continue;
                }
                Err(other) => return Err(other),
            };

            let converted = round_money(&(required_amount * &rate));
            if converted <= balance.amount {
                tracing::info!(
                    from = %preferred,
                    to = %balance.currency,
                    %rate,
                    amount = %converted,
                    "Funding payout from converted balance"
                );
                return Ok(CurrencyResolution {
                    currency: balance.currency.clone(),
                    amount: converted,
                    converted: true,
                    rate,
                });
            }
        }

        match rate_failure {
            Some(err) => Err(err),
            None => Err(SettlementError::InsufficientBalance {
                currency: preferred,
                required: required_amount.to_string(),
            }),
        }
    }

    async fn fresh_rate(
        &self,
        from: &str,
        to: &str,
        now: DateTime<Utc>,
    ) -> Result<BigDecimal, SettlementError> {
        let unavailable = |reason: String| SettlementError::ExchangeRateUnavailable {
            base: from.to_string(),
            target: to.to_string(),
            reason,
        };

        let snapshot = self
            .rates
            .latest(from, to)
            .await?
            .ok_or_else(|| unavailable("no snapshot recorded".to_string()))?;
        if !snapshot.is_fresh(now, self.max_age) {
            return Err(unavailable(format!(
                "latest snapshot captured at {} is older than {} hours",
                snapshot.captured_at,
                self.max_age.num_hours()
            )));
        }
        snapshot
            .rate_for(from, to)
            .ok_or_else(|| unavailable("snapshot does not cover pair".to_string()))
    }
}
