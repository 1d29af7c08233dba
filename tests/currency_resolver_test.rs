mod common;

use chrono::{Duration, Utc};
use std::sync::Arc;

use common::{dec, FakeProvider, FakeRates};
use settlement_core::domain::ExchangeRateSnapshot;
use settlement_core::error::SettlementError;
use settlement_core::services::CurrencyResolver;

const ACCOUNT: &str = "acct_seller_1";

fn resolver(provider: Arc<FakeProvider>, rates: Arc<FakeRates>) -> CurrencyResolver {
    CurrencyResolver::new(
        provider,
        rates,
        vec!["usd".to_string(), "eur".to_string(), "gbp".to_string()],
        Duration::hours(24),
    )
}

fn snapshot(base: &str, target: &str, rate: &str, age_hours: i64) -> ExchangeRateSnapshot {
    ExchangeRateSnapshot::new(base, target, dec(rate), Utc::now() - Duration::hours(age_hours), "test")
        .unwrap()
}

#[tokio::test]
async fn test_preferred_currency_wins_when_it_covers_the_amount() {
    let provider = Arc::new(FakeProvider::new());
    provider.set_balance(ACCOUNT, &[("eur", "5000.00"), ("usd", "120.00")]);
    let rates = Arc::new(FakeRates::default());

    let resolution = resolver(provider, rates)
        .resolve("USD", &dec("100.00"), ACCOUNT, Utc::now())
        .await
        .unwrap();

    assert_eq!(resolution.currency, "usd");
    assert_eq!(resolution.amount, dec("100.00"));
    assert!(!resolution.converted);
}

#[tokio::test]
async fn test_converts_through_fresh_rate() {
    let provider = Arc::new(FakeProvider::new());
    provider.set_balance(ACCOUNT, &[("usd", "10.00"), ("eur", "500.00")]);
    let rates = Arc::new(FakeRates::default());
    rates.add(snapshot("usd", "eur", "0.90", 1));

    let resolution = resolver(provider, rates)
        .resolve("usd", &dec("100.00"), ACCOUNT, Utc::now())
        .await
        .unwrap();

    assert_eq!(resolution.currency, "eur");
    assert_eq!(resolution.amount, dec("90.00"));
    assert!(resolution.converted);
}

#[tokio::test]
async fn test_inverse_snapshot_is_used() {
    let provider = Arc::new(FakeProvider::new());
    provider.set_balance(ACCOUNT, &[("eur", "500.00")]);
    let rates = Arc::new(FakeRates::default());
    rates.add(snapshot("eur", "usd", "1.25", 2));

    let resolution = resolver(provider, rates)
        .resolve("usd", &dec("100.00"), ACCOUNT, Utc::now())
        .await
        .unwrap();

    assert_eq!(resolution.currency, "eur");
    assert_eq!(resolution.amount, dec("80.00"));
}

#[tokio::test]
async fn test_stale_rate_is_a_hard_failure() {
    let provider = Arc::new(FakeProvider::new());
    provider.set_balance(ACCOUNT, &[("usd", "10.00"), ("eur", "500.00")]);
    let rates = Arc::new(FakeRates::default());
    rates.add(snapshot("usd", "eur", "0.90", 30));

    let err = resolver(provider, rates)
        .resolve("usd", &dec("100.00"), ACCOUNT, Utc::now())
        .await
        .unwrap_err();

    assert!(matches!(err, SettlementError::ExchangeRateUnavailable { .. }));
}

#[tokio::test]
async fn test_missing_rate_is_a_hard_failure() {
    let provider = Arc::new(FakeProvider::new());
    provider.set_balance(ACCOUNT, &[("gbp", "500.00")]);
    let rates = Arc::new(FakeRates::default());

    let err = resolver(provider, rates)
        .resolve("usd", &dec("100.00"), ACCOUNT, Utc::now())
        .await
        .unwrap_err();

    assert!(matches!(err, SettlementError::ExchangeRateUnavailable { .. }));
}

#[tokio::test]
async fn test_insufficient_balance_everywhere() {
    let provider = Arc::new(FakeProvider::new());
    provider.set_balance(ACCOUNT, &[("usd", "10.00"), ("eur", "20.00")]);
    let rates = Arc::new(FakeRates::default());
    rates.add(snapshot("usd", "eur", "0.90", 1));

    let err = resolver(provider, rates)
        .resolve("usd", &dec("100.00"), ACCOUNT, Utc::now())
        .await
        .unwrap_err();

    assert!(matches!(err, SettlementError::InsufficientBalance { .. }));
}

#[tokio::test]
async fn test_equal_balances_follow_preference_order() {
    let provider = Arc::new(FakeProvider::new());
    provider.set_balance(ACCOUNT, &[("gbp", "500.00"), ("eur", "500.00")]);
    let rates = Arc::new(FakeRates::default());
    rates.add(snapshot("usd", "eur", "0.90", 1));
    rates.add(snapshot("usd", "gbp", "0.80", 1));

    let resolution = resolver(provider, rates)
        .resolve("usd", &dec("100.00"), ACCOUNT, Utc::now())
        .await
        .unwrap();

    assert_eq!(resolution.currency, "eur");
}
