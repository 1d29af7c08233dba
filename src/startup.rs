use crate::config::Config;
use anyhow::{Context, Result};
use sqlx::PgPool;

pub struct ValidationReport {
    pub environment: bool,
    pub database: bool,
    pub migrations: bool,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.environment && self.database && self.migrations
    }

    pub fn print(&self) {
        println!("\n=== Startup Validation Report ===");
        println!("Environment Variables: {}", status(self.environment));
        println!("Database Connectivity: {}", status(self.database));
        println!("Migrations Applied:    {}", status(self.migrations));

        if !self.errors.is_empty() {
            println!("\nErrors:");
            for error in &self.errors {
                println!("  - {}", error);
            }
        }

        println!("\nOverall Status: {}", if self.is_valid() { "PASS" } else { "FAIL" });
        println!("=================================\n");
    }
}

fn status(ok: bool) -> &'static str {
    if ok {
        "OK"
    } else {
        "FAIL"
    }
}

pub async fn validate_environment(config: &Config, pool: &PgPool) -> ValidationReport {
    let mut report = ValidationReport {
        environment: true,
        database: true,
        migrations: true,
        errors: Vec::new(),
    };

    if let Err(e) = validate_env_vars(config) {
        report.environment = false;
        report.errors.push(format!("Environment: {:#}", e));
    }

    match validate_database(pool).await {
        Ok(()) => {
            if let Err(e) = validate_migrations(pool).await {
                report.migrations = false;
                report.errors.push(format!("Migrations: {:#}", e));
            }
        }
        Err(e) => {
            report.database = false;
            report.migrations = false;
            report.errors.push(format!("Database: {:#}", e));
        }
    }

    report
}

fn validate_env_vars(config: &Config) -> Result<()> {
    if config.server_port == 0 {
        anyhow::bail!("SERVER_PORT must be greater than 0");
    }
    for (name, secret) in [
        ("PROVIDER_API_KEY", &config.provider_api_key),
        ("PROVIDER_WEBHOOK_SECRET", &config.provider_webhook_secret),
        ("ADMIN_API_KEY", &config.admin_api_key),
    ] {
        if secret.trim().is_empty() {
            anyhow::bail!("{} is empty", name);
        }
    }
    if config.webhook_tolerance_secs <= 0 {
        anyhow::bail!("WEBHOOK_TOLERANCE_SECS must be positive");
    }

    url::Url::parse(&config.database_url).context("DATABASE_URL is not a valid URL")?;
    url::Url::parse(&config.provider_api_url).context("PROVIDER_API_URL is not a valid URL")?;
    url::Url::parse(&config.marketplace_api_url).context("MARKETPLACE_API_URL is not a valid URL")?;

    Ok(())
}

async fn validate_database(pool: &PgPool) -> Result<()> {
    sqlx::query("SELECT 1")
        .fetch_one(pool)
        .await
        .context("Failed to connect to database")?;
    Ok(())
}

async fn validate_migrations(pool: &PgPool) -> Result<()> {
    let applied: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM _sqlx_migrations WHERE success")
        .fetch_one(pool)
        .await
        .context("Failed to check migrations table")?;

    if applied == 0 {
        anyhow::bail!("No migrations applied");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(overrides: &[(&'static str, &'static str)]) -> Config {
        let mut vars: HashMap<&str, &str> = HashMap::from([
            ("DATABASE_URL", "postgres://localhost:5432/settlement"),
            ("PROVIDER_API_KEY", "sk_test_123456"),
            ("PROVIDER_WEBHOOK_SECRET", "whsec_abcdef"),
            ("MARKETPLACE_API_URL", "http://marketplace.local"),
            ("ADMIN_API_KEY", "admin-key"),
        ]);
        vars.extend(overrides.iter().copied());
        Config::from_lookup(|key| vars.get(key).map(|v| v.to_string())).unwrap()
    }

    #[test]
    fn test_validate_env_vars_accepts_defaults() {
        assert!(validate_env_vars(&config(&[])).is_ok());
    }

    #[test]
    fn test_validate_env_vars_invalid_url() {
        let config = config(&[("MARKETPLACE_API_URL", "not-a-url")]);
        let err = validate_env_vars(&config).unwrap_err();
        assert!(err.to_string().contains("MARKETPLACE_API_URL"));
    }

    #[test]
    fn test_validate_env_vars_rejects_zero_tolerance() {
        let config = config(&[("WEBHOOK_TOLERANCE_SECS", "0")]);
        assert!(validate_env_vars(&config).is_err());
    }

    #[test]
    fn test_report_requires_every_check() {
        let report = ValidationReport {
            environment: true,
            database: true,
            migrations: false,
            errors: vec!["Migrations: No migrations applied".to_string()],
        };
        assert!(!report.is_valid());
    }
}
