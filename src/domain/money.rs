//! Money helpers: rounding, minor units and the per-seller fee split.

use bigdecimal::{BigDecimal, ToPrimitive, Zero};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::error::SettlementError;

const ZERO_DECIMAL_CURRENCIES: &[&str] = &["jpy", "krw", "vnd", "clp", "isk", "huf"];

/// Rounds to cents and pins the scale so amounts render as `91.80`.
pub fn round_money(value: &BigDecimal) -> BigDecimal {
    value.round(2).with_scale(2)
}

fn minor_unit_scale(currency: &str) -> i64 {
    if ZERO_DECIMAL_CURRENCIES.contains(&currency.to_ascii_lowercase().as_str()) {
        0
    } else {
        2
    }
}

pub fn to_minor_units(amount: &BigDecimal, currency: &str) -> Result<i64, SettlementError> {
    let factor = BigDecimal::from(10i64.pow(minor_unit_scale(currency) as u32));
    (amount * factor)
        .round(0)
        .to_i64()
        .ok_or_else(|| SettlementError::Validation(format!("amount {} out of range", amount)))
}

pub fn from_minor_units(units: i64, currency: &str) -> BigDecimal {
    let scale = minor_unit_scale(currency);
    let factor = BigDecimal::from(10i64.pow(scale as u32));
    (BigDecimal::from(units) / factor).with_scale(scale)
}

/// One line of an order as reported by the marketplace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub seller_id: Uuid,
    pub unit_price: BigDecimal,
    pub quantity: i32,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct FeeSchedule {
    pub platform_percent: BigDecimal,
    pub provider_percent: BigDecimal,
    pub provider_fixed: BigDecimal,
}

impl FeeSchedule {
    pub fn platform_fee(&self, gross: &BigDecimal) -> BigDecimal {
        round_money(&(gross * &self.platform_percent / BigDecimal::from(100)))
    }

    pub fn provider_fee_total(&self, gross: &BigDecimal) -> BigDecimal {
        round_money(&(gross * &self.provider_percent / BigDecimal::from(100) + &self.provider_fixed))
    }
}

/// A seller's part of one order.
#[derive(Debug, Clone, PartialEq)]
pub struct SellerShare {
    pub seller_id: Uuid,
    pub currency: String,
    pub gross: BigDecimal,
    pub platform_fee: BigDecimal,
    pub provider_fee: BigDecimal,
}

/// Groups order lines by seller and apportions fees.
///
/// The provider fee is charged once per payment, so it is split by gross share;
/// the last seller absorbs the rounding remainder so the shares sum exactly.
pub fn split_by_seller(
    lines: &[OrderLine],
    schedule: &FeeSchedule,
) -> Result<Vec<SellerShare>, SettlementError> {
    if lines.is_empty() {
        return Err(SettlementError::Validation("order has no line items".to_string()));
    }
    let currency = lines[0].currency.to_ascii_lowercase();
    if lines
        .iter()
        .any(|line| line.currency.to_ascii_lowercase() != currency)
    {
        return Err(SettlementError::Validation(
            "order lines span more than one currency".to_string(),
        ));
    }

    let mut gross_by_seller: BTreeMap<Uuid, BigDecimal> = BTreeMap::new();
    for line in lines {
        if line.quantity <= 0 || line.unit_price < BigDecimal::zero() {
            return Err(SettlementError::Validation(format!(
                "invalid order line for seller {}",
                line.seller_id
            )));
        }
        let entry = gross_by_seller
            .entry(line.seller_id)
            .or_insert_with(BigDecimal::zero);
        *entry += &line.unit_price * BigDecimal::from(line.quantity);
    }

    let total_gross: BigDecimal = gross_by_seller.values().cloned().sum();
    let total_provider_fee = schedule.provider_fee_total(&total_gross);
    let seller_count = gross_by_seller.len();

    let mut shares = Vec::with_capacity(seller_count);
    let mut allocated_provider_fee = BigDecimal::zero();
    for (index, (seller_id, gross)) in gross_by_seller.into_iter().enumerate() {
        let gross = round_money(&gross);
        let provider_fee = if index + 1 == seller_count {
            round_money(&(&total_provider_fee - &allocated_provider_fee))
        } else if total_gross.is_zero() {
            round_money(&BigDecimal::zero())
        } else {
            round_money(&(&total_provider_fee * &gross / &total_gross))
        };
        allocated_provider_fee += &provider_fee;

        shares.push(SellerShare {
            seller_id,
            currency: currency.clone(),
            platform_fee: schedule.platform_fee(&gross),
            provider_fee,
            gross,
        });
    }

    Ok(shares)
}
