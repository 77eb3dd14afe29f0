use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use bill_runs_rs::{
    config::Config,
    db::init_pool,
    gateway::{ChargeSubmissionGateway, HttpChargeGateway, HttpGatewayConfig, StubChargeGateway},
    health::{health, metrics},
    metrics::Metrics,
    repos::PgBillingRepository,
    worker::start_bill_run_worker,
    BillRunService,
};

#[tokio::main]
async fn main() {
    // Load environment variables from .env file (if present)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    tracing::info!("Starting bill run worker service...");

    let config = Config::from_env().expect("Failed to load configuration from environment");

    tracing::info!(
        "Configuration loaded: host={}, port={}, gateway={}",
        config.host,
        config.port,
        config.charge_gateway_url.as_deref().unwrap_or("stub")
    );

    tracing::info!("Connecting to database...");
    let pool = init_pool(&config.database_url, &config.pool)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running migrations...");
    sqlx::migrate!("./db/migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let gateway: Arc<dyn ChargeSubmissionGateway> = match HttpGatewayConfig::from_config(&config)
        .expect("Invalid charge gateway configuration")
    {
        Some(gateway_config) => {
            tracing::info!("Using HTTP charge gateway at {}", gateway_config.base_url);
            Arc::new(HttpChargeGateway::new(gateway_config).expect("Failed to build HTTP client"))
        }
        None => {
            tracing::warn!("CHARGE_GATEWAY_URL not set, using stub charge gateway");
            Arc::new(StubChargeGateway::new())
        }
    };

    let metrics_registry = Metrics::new();
    let service = BillRunService::new(
        Arc::new(PgBillingRepository::new(pool)),
        gateway,
        config.charge_gateway_timeout,
        metrics_registry.clone(),
    );

    start_bill_run_worker(service, config.poll_interval);

    let app = Router::new()
        .route("/api/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(Arc::new(metrics_registry));

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .expect("Invalid HOST/PORT");
    tracing::info!("Bill run service listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind address");

    axum::serve(listener, app)
        .await
        .expect("Server failed to start");
}
