mod cli;

use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Commands, DbCommands};
use settlement_core::config::{Config, LogFormat};
use settlement_core::marketplace::MarketplaceClient;
use settlement_core::provider::{StripeClient, WebhookVerifier};
use settlement_core::services::{
    spawn_order_status_listener, Collaborators, EventBus, PgExchangeRateSource, SettlementServices,
};
use settlement_core::{create_app, db, startup, AppState};

const EVENT_BUS_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env()?;

    init_tracing(config.log_format);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Db(DbCommands::Migrate) => cli::handle_db_migrate(&config).await,
        Commands::Config => cli::handle_config_validate(&config),
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let pool = db::create_pool(&config).await?;

    db::run_migrations(&pool).await?;
    tracing::info!("Database migrations completed");

    let report = startup::validate_environment(&config, &pool).await;
    if !report.is_valid() {
        report.print();
        anyhow::bail!("startup validation failed");
    }

    let verifier = WebhookVerifier::new(
        config.provider_webhook_secret.clone(),
        config.webhook_tolerance_secs,
    );
    let provider = Arc::new(StripeClient::new(
        config.provider_api_url.clone(),
        config.provider_api_key.clone(),
        verifier,
    ));
    tracing::info!(url = %config.provider_api_url, "Payment provider client initialized");

    let marketplace = Arc::new(MarketplaceClient::new(config.marketplace_api_url.clone()));
    tracing::info!(url = %config.marketplace_api_url, "Marketplace client initialized");

    let events = EventBus::new(EVENT_BUS_CAPACITY);
    let _listener = spawn_order_status_listener(&events, marketplace.clone());

    let collaborators = Collaborators {
        provider,
        orders: marketplace.clone(),
        sellers: marketplace,
        rates: Arc::new(PgExchangeRateSource::new(pool.clone())),
    };
    let services = SettlementServices::new(&config, pool.clone(), collaborators, events);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let app = create_app(AppState {
        config: Arc::new(config),
        pool,
        services,
    });

    tracing::info!("listening on {}", addr);
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "Failed to listen for shutdown signal");
        return;
    }
    tracing::info!("Shutdown signal received");
}
