use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use appointment_cell::{SupabaseProfileDirectory, SupabaseReservationStore};
use confirmation_cell::{ConfirmationProcessor, ConfirmationWorker, HttpNotifier, WorkerConfig};
use event_bus_cell::{RedisEventBus, Topology};
use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting appointment confirmation worker");

    let config = AppConfig::from_env();
    if config.uses_default_webhook_secret() {
        warn!("WEBHOOK_SECRET not set, using the development default");
    }

    let supabase = Arc::new(SupabaseClient::new(&config));
    let topology = Topology::appointments(Duration::from_millis(config.retry_delay_ms));
    let bus = Arc::new(RedisEventBus::new(&config, topology).await?);

    let processor = ConfirmationProcessor::new(
        Arc::new(SupabaseReservationStore::new(supabase.clone())),
        Arc::new(SupabaseProfileDirectory::new(supabase)),
        bus.clone(),
        Arc::new(HttpNotifier::new(&config)?),
        &config,
    );
    let worker = ConfirmationWorker::new(bus, Arc::new(processor), WorkerConfig::from_app_config(&config));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            // Dropping the sender would stop the consumers
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, draining consumers");
        let _ = shutdown_tx.send(true);
    });

    worker.run(shutdown_rx).await
}
