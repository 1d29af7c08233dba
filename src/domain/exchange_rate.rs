use bigdecimal::{BigDecimal, One, Zero};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SettlementError;

/// One captured rate: 1 unit of `base_currency` buys `rate` units of
/// `target_currency`. Rows are never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeRateSnapshot {
    pub id: Uuid,
    pub base_currency: String,
    pub target_currency: String,
    pub rate: BigDecimal,
    pub captured_at: DateTime<Utc>,
    pub source: String,
}

impl ExchangeRateSnapshot {
    pub fn new(
        base_currency: &str,
        target_currency: &str,
        rate: BigDecimal,
        captured_at: DateTime<Utc>,
        source: impl Into<String>,
    ) -> Result<Self, SettlementError> {
        if rate <= BigDecimal::zero() {
            return Err(SettlementError::Validation(format!(
                "exchange rate must be positive, got {}",
                rate
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            base_currency: base_currency.to_ascii_lowercase(),
            target_currency: target_currency.to_ascii_lowercase(),
            rate,
            captured_at,
            source: source.into(),
        })
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        now - self.captured_at <= max_age
    }

    /// Rate for converting `from -> to` using this snapshot, inverting it when
    /// the snapshot was stored for the opposite direction.
    pub fn rate_for(&self, from: &str, to: &str) -> Option<BigDecimal> {
        if self.base_currency == from && self.target_currency == to {
            Some(self.rate.clone())
        } else if self.base_currency == to && self.target_currency == from {
            Some(BigDecimal::one() / &self.rate)
        } else {
            None
        }
    }
}
