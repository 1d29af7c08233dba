use anyhow::{Context, Result};
use bigdecimal::{BigDecimal, Zero};
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::db::RetryPolicy;
use crate::domain::money::FeeSchedule;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_url: String,
    pub database_max_connections: u32,
    pub provider_api_url: String,
    pub provider_api_key: String,
    pub provider_webhook_secret: String,
    pub webhook_tolerance_secs: i64,
    pub marketplace_api_url: String,
    pub admin_api_key: String,
    pub hold_days: i64,
    pub platform_fee_percent: BigDecimal,
    pub provider_fee_percent: BigDecimal,
    pub provider_fee_fixed: BigDecimal,
    pub retry_max_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub retry_backoff: f64,
    pub max_transfer_retries: i32,
    pub exchange_rate_max_age_hours: i64,
    pub currency_preference: Vec<String>,
    pub stuck_payout_hours: i64,
    pub log_format: LogFormat,
    pub log_request_body: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok(); // Load .env file if present
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            lookup(key)
                .filter(|value| !value.trim().is_empty())
                .with_context(|| format!("{} must be set", key))
        };

        let config = Config {
            server_port: parse_or(&lookup, "SERVER_PORT", 3000)?,
            database_url: required("DATABASE_URL")?,
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            provider_api_url: lookup("PROVIDER_API_URL")
                .unwrap_or_else(|| "https://api.stripe.com".to_string()),
            provider_api_key: required("PROVIDER_API_KEY")?,
            provider_webhook_secret: required("PROVIDER_WEBHOOK_SECRET")?,
            webhook_tolerance_secs: parse_or(&lookup, "WEBHOOK_TOLERANCE_SECS", 300)?,
            marketplace_api_url: required("MARKETPLACE_API_URL")?,
            admin_api_key: required("ADMIN_API_KEY")?,
            hold_days: parse_or(&lookup, "HOLD_DAYS", 30)?,
            platform_fee_percent: parse_decimal_or(&lookup, "PLATFORM_FEE_PERCENT", "5.0")?,
            provider_fee_percent: parse_decimal_or(&lookup, "PROVIDER_FEE_PERCENT", "2.9")?,
            provider_fee_fixed: parse_decimal_or(&lookup, "PROVIDER_FEE_FIXED", "0.30")?,
            retry_max_attempts: parse_or(&lookup, "RETRY_MAX_ATTEMPTS", 3)?,
            retry_base_delay_ms: parse_or(&lookup, "RETRY_BASE_DELAY_MS", 10)?,
            retry_backoff: parse_or(&lookup, "RETRY_BACKOFF", 2.0)?,
            max_transfer_retries: parse_or(&lookup, "MAX_TRANSFER_RETRIES", 3)?,
            exchange_rate_max_age_hours: parse_or(&lookup, "EXCHANGE_RATE_MAX_AGE_HOURS", 24)?,
            currency_preference: parse_currency_list(
                &lookup("CURRENCY_PREFERENCE").unwrap_or_else(|| "usd,eur,gbp".to_string()),
            ),
            stuck_payout_hours: parse_or(&lookup, "STUCK_PAYOUT_HOURS", 72)?,
            log_format: match lookup("LOG_FORMAT").as_deref() {
                Some("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
            log_request_body: parse_or(&lookup, "LOG_REQUEST_BODY", false)?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        let hundred = BigDecimal::from(100);
        for (name, percent) in [
            ("PLATFORM_FEE_PERCENT", &self.platform_fee_percent),
            ("PROVIDER_FEE_PERCENT", &self.provider_fee_percent),
        ] {
            if percent < &BigDecimal::zero() || percent >= &hundred {
                anyhow::bail!("{} must be in [0, 100), got {}", name, percent);
            }
        }
        if self.provider_fee_fixed < BigDecimal::zero() {
            anyhow::bail!("PROVIDER_FEE_FIXED must not be negative");
        }
        if self.hold_days < 0 {
            anyhow::bail!("HOLD_DAYS must not be negative");
        }
        if self.retry_max_attempts == 0 {
            anyhow::bail!("RETRY_MAX_ATTEMPTS must be at least 1");
        }
        if self.retry_backoff < 1.0 {
            anyhow::bail!("RETRY_BACKOFF must be at least 1.0");
        }
        if self.currency_preference.is_empty() {
            anyhow::bail!("CURRENCY_PREFERENCE must list at least one currency");
        }
        Ok(())
    }

    pub fn fee_schedule(&self) -> FeeSchedule {
        FeeSchedule {
            platform_percent: self.platform_fee_percent.clone(),
            provider_percent: self.provider_fee_percent.clone(),
            provider_fixed: self.provider_fee_fixed.clone(),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_max_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            backoff: self.retry_backoff,
        }
    }

    /// Human-readable dump with secrets masked.
    pub fn describe(&self) -> Vec<(&'static str, String)> {
        vec![
            ("SERVER_PORT", self.server_port.to_string()),
            ("DATABASE_URL", mask(&self.database_url)),
            ("DATABASE_MAX_CONNECTIONS", self.database_max_connections.to_string()),
            ("PROVIDER_API_URL", self.provider_api_url.clone()),
            ("PROVIDER_API_KEY", mask(&self.provider_api_key)),
            ("PROVIDER_WEBHOOK_SECRET", mask(&self.provider_webhook_secret)),
            ("WEBHOOK_TOLERANCE_SECS", self.webhook_tolerance_secs.to_string()),
            ("MARKETPLACE_API_URL", self.marketplace_api_url.clone()),
            ("ADMIN_API_KEY", mask(&self.admin_api_key)),
            ("HOLD_DAYS", self.hold_days.to_string()),
            ("PLATFORM_FEE_PERCENT", self.platform_fee_percent.to_string()),
            ("PROVIDER_FEE_PERCENT", self.provider_fee_percent.to_string()),
            ("PROVIDER_FEE_FIXED", self.provider_fee_fixed.to_string()),
            ("RETRY_MAX_ATTEMPTS", self.retry_max_attempts.to_string()),
            ("RETRY_BASE_DELAY_MS", self.retry_base_delay_ms.to_string()),
            ("RETRY_BACKOFF", self.retry_backoff.to_string()),
            ("MAX_TRANSFER_RETRIES", self.max_transfer_retries.to_string()),
            ("EXCHANGE_RATE_MAX_AGE_HOURS", self.exchange_rate_max_age_hours.to_string()),
            ("CURRENCY_PREFERENCE", self.currency_preference.join(",")),
            ("STUCK_PAYOUT_HOURS", self.stuck_payout_hours.to_string()),
            (
                "LOG_FORMAT",
                match self.log_format {
                    LogFormat::Text => "text".to_string(),
                    LogFormat::Json => "json".to_string(),
                },
            ),
            ("LOG_REQUEST_BODY", self.log_request_body.to_string()),
        ]
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value '{}'", key, raw)),
        None => Ok(default),
    }
}

fn parse_decimal_or(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: &str,
) -> Result<BigDecimal> {
    let raw = lookup(key).unwrap_or_else(|| default.to_string());
    BigDecimal::from_str(raw.trim()).with_context(|| format!("{} is not a decimal: '{}'", key, raw))
}

fn parse_currency_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|entry| entry.trim().to_ascii_lowercase())
        .filter(|entry| !entry.is_empty())
        .collect()
}

fn mask(secret: &str) -> String {
    if secret.chars().count() <= 4 {
        return "****".to_string();
    }
    format!("{}****", secret.chars().take(4).collect::<String>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn base_vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("DATABASE_URL", "postgres://localhost/settlement"),
            ("PROVIDER_API_KEY", "sk_test_123456"),
            ("PROVIDER_WEBHOOK_SECRET", "whsec_abcdef"),
            ("MARKETPLACE_API_URL", "http://marketplace.local"),
            ("ADMIN_API_KEY", "admin-key"),
        ])
    }

    fn load(vars: &HashMap<&'static str, &'static str>) -> Result<Config> {
        Config::from_lookup(|key| vars.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults_apply() {
        let config = load(&base_vars()).unwrap();

        assert_eq!(config.server_port, 3000);
        assert_eq!(config.hold_days, 30);
        assert_eq!(config.max_transfer_retries, 3);
        assert_eq!(config.currency_preference, vec!["usd", "eur", "gbp"]);
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.retry_policy().base_delay, Duration::from_millis(10));
    }

    #[test]
    fn test_missing_required_variable() {
        let mut vars = base_vars();
        vars.remove("PROVIDER_WEBHOOK_SECRET");

        let err = load(&vars).unwrap_err();
        assert!(err.to_string().contains("PROVIDER_WEBHOOK_SECRET"));
    }

    #[test]
    fn test_fee_percent_out_of_range_is_rejected() {
        let mut vars = base_vars();
        vars.insert("PLATFORM_FEE_PERCENT", "100");
        assert!(load(&vars).is_err());
    }

    #[test]
    fn test_currency_preference_is_normalised() {
        let mut vars = base_vars();
        vars.insert("CURRENCY_PREFERENCE", " EUR, usd ,,GBP");
        let config = load(&vars).unwrap();
        assert_eq!(config.currency_preference, vec!["eur", "usd", "gbp"]);
    }

    #[test]
    fn test_describe_masks_secrets() {
        let config = load(&base_vars()).unwrap();
        let described: HashMap<_, _> = config.describe().into_iter().collect();

        assert_eq!(described["PROVIDER_API_KEY"], "sk_t****");
        assert_eq!(described["ADMIN_API_KEY"], "admi****");
        assert_eq!(described["HOLD_DAYS"], "30");
    }
}
