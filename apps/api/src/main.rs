use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dotenv::dotenv;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{self, TraceLayer};
use tracing::{info, warn, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod router;

use appointment_cell::{AppointmentCellState, SupabaseProfileDirectory, SupabaseReservationStore};
use event_bus_cell::{EventBus, RedisEventBus, Topology};
use shared_config::AppConfig;
use shared_database::supabase::SupabaseClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Loading Env Vars
    dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting clinic booking API server");

    // Load configuration
    let config = Arc::new(AppConfig::from_env());
    if config.uses_default_webhook_secret() {
        warn!("WEBHOOK_SECRET not set, using the development default");
    }

    // Backing services
    let supabase = Arc::new(SupabaseClient::new(&config));
    let topology = Topology::appointments(Duration::from_millis(config.retry_delay_ms));
    let bus = Arc::new(RedisEventBus::new(&config, topology).await?);
    bus.declare_topology().await?;

    let state = Arc::new(AppointmentCellState::new(
        config.clone(),
        Arc::new(SupabaseReservationStore::new(supabase.clone())),
        Arc::new(SupabaseProfileDirectory::new(supabase)),
        bus,
    ));

    // Set up CORS
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the application router
    let app = router::create_router(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(trace::DefaultMakeSpan::new().level(Level::INFO))
                .on_response(trace::DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors);

    // Run the server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
