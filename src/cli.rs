use clap::{Parser, Subcommand};

use settlement_core::config::Config;

#[derive(Parser)]
#[command(name = "settlement-core")]
#[command(about = "Settlement Core - marketplace payment settlement service", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the HTTP server (default)
    Serve,

    /// Database management commands
    #[command(subcommand)]
    Db(DbCommands),

    /// Validate and print the configuration with secrets masked
    Config,
}

#[derive(Subcommand)]
pub enum DbCommands {
    /// Run database migrations
    Migrate,
}

pub async fn handle_db_migrate(config: &Config) -> anyhow::Result<()> {
    let pool = settlement_core::db::create_pool(config).await?;

    tracing::info!("Running database migrations...");
    settlement_core::db::run_migrations(&pool).await?;

    tracing::info!("Database migrations completed");
    println!("Database migrations completed");

    Ok(())
}

pub fn handle_config_validate(config: &Config) -> anyhow::Result<()> {
    tracing::info!("Validating configuration...");

    println!("Configuration:");
    for (key, value) in config.describe() {
        println!("  {:<28} {}", key, value);
    }

    tracing::info!("Configuration is valid");
    println!("Configuration is valid");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_no_subcommand() {
        let cli = Cli::try_parse_from(["settlement-core"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_parses_db_migrate() {
        let cli = Cli::try_parse_from(["settlement-core", "db", "migrate"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Db(DbCommands::Migrate))));
    }
}
