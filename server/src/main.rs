use tracing_subscriber::{filter::EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};
use txm_service::{chains, config};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config::get_config()?;

    let subscriber = tracing_subscriber::registry().with(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            // Default to debug for our crates if RUST_LOG is not set
            "txm_service=debug,txm_executors=debug,txm_core=debug".into()
        }),
    );

    match config.server.log_format {
        config::LogFormat::Json => subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        config::LogFormat::Pretty => subscriber.with(tracing_subscriber::fmt::layer()).init(),
    }

    let redis_client = redis::Client::open(config.redis.url.as_str())?;
    let redis = redis_client.get_connection_manager().await?;
    tracing::info!("Redis connection initialized");

    let registry = chains::build_registry(&config, redis)?;
    tracing::info!(chains = ?registry.chain_ids(), "Transaction managers initialized");

    registry.start_all().await?;

    tracing::info!("Transaction managers started, waiting for shutdown signal");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for Ctrl+C: {}", e);
    }
    tracing::info!("Shutdown signal received");

    if let Err(e) = registry.close_all().await {
        tracing::error!("Error during coordinated shutdown: {}", e);
    } else {
        tracing::info!("All transaction managers shut down successfully");
    }

    Ok(())
}
