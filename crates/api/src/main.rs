//! API server entry point.

use std::sync::Arc;

use api::config::{Config, LogFormat};
use billing::{
    CheckoutGateway, InMemoryAttemptStore, PostgresAttemptStore, SharedAttemptStore,
    StripeCheckoutGateway,
};
use event_bus::{InMemoryEventBus, PostgresEventBus, SharedEventBus};
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

/// PostgreSQL when `DATABASE_URL` is set, otherwise in-memory.
async fn open_storage(config: &Config) -> (SharedEventBus, SharedAttemptStore) {
    let Some(url) = config.database_url.as_deref() else {
        tracing::info!("DATABASE_URL not set, using in-memory storage");
        return (
            Arc::new(InMemoryEventBus::new(config.bus_partitions)),
            Arc::new(InMemoryAttemptStore::new()),
        );
    };

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(url)
        .await
        .expect("failed to connect to PostgreSQL");
    let bus = PostgresEventBus::new(pool.clone(), config.bus_partitions);
    bus.run_migrations().await.expect("failed to run migrations");
    tracing::info!("using PostgreSQL storage");

    (Arc::new(bus), Arc::new(PostgresAttemptStore::new(pool)))
}

#[tokio::main]
async fn main() {
    // 1. Load configuration (.env first, then the process environment)
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    // 2. Initialize tracing
    init_tracing(&config);

    // 3. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 4. Storage, gateway and saga components
    let (bus, attempts) = open_storage(&config).await;
    let gateway: Arc<dyn CheckoutGateway> = Arc::new(
        StripeCheckoutGateway::new(
            config.gateway_base_url.clone(),
            config.gateway_api_key.clone().unwrap_or_default(),
            config.gateway_timeout,
        )
        .expect("failed to build gateway client"),
    );
    let services = api::build_services(&config, bus, attempts, gateway);

    // 5. Start consumers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumers = [services.billing_consumer, services.records_consumer]
        .into_iter()
        .map(|consumer| {
            let consumer = Arc::new(consumer);
            tokio::spawn(consumer.run(config.consumer_poll, shutdown_rx.clone()))
        })
        .collect::<Vec<_>>();

    // 6. Build the application and start the server
    let app = api::create_app(services.state, metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // 7. Stop consumers after in-flight requests finished
    let _ = shutdown_tx.send(true);
    for consumer in consumers {
        if let Err(e) = consumer.await {
            tracing::error!(error = %e, "consumer task failed");
        }
    }

    tracing::info!("server shut down gracefully");
}
