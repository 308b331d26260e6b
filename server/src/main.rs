use std::sync::Arc;

use dotenvy::dotenv;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use ticketing_server::checkout::ExpiryReaper;
use ticketing_server::config::Config;
use ticketing_server::payment::LoggingPaymentGateway;
use ticketing_server::routes::create_routes;
use ticketing_server::state::AppState;
use ticketing_server::store::PgStore;

#[tokio::main]
async fn main() {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().expect("Invalid configuration");

    let store = PgStore::connect(&config)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Successfully connected to database");

    sqlx::migrate!()
        .run(store.pool())
        .await
        .expect("Failed to run migrations");

    tracing::info!("Migrations run successfully");

    let expiry =
        chrono::Duration::from_std(config.order_expiry).expect("ORDER_EXPIRY_SECS out of range");
    let reaper = ExpiryReaper::new(store.clone(), expiry, config.reaper_batch_size);
    tokio::spawn(reaper.run(config.reaper_interval));
    tracing::info!(
        expiry_secs = config.order_expiry.as_secs(),
        interval_secs = config.reaper_interval.as_secs(),
        "Expiry reaper started"
    );

    let state = AppState::new(store, Arc::new(LoggingPaymentGateway));
    let app = create_routes(state, &config);

    tracing::info!("🚀 Server running at http://{}", config.bind_addr);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app).await.expect("Server failed");
}
