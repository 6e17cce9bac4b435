use std::{net::SocketAddr, str::FromStr, sync::Arc};

use courier::{
    circuit::CircuitBreakerRegistry,
    dispatcher::{DeliveryClient, Dispatcher, DispatcherConfig, WorkerPool},
    handlers,
    state::AppState,
    store::SqliteStore,
    telemetry,
    time::{Clock, SystemClock},
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init();

    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:courier.db".to_string());
    let bind_addr =
        std::env::var("COURIER_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3001".to_string());
    let admin_api_token = std::env::var("COURIER_ADMIN_TOKEN")
        .ok()
        .filter(|token| !token.trim().is_empty());

    let options = SqliteConnectOptions::from_str(&database_url)?
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    let config = DispatcherConfig::from_env();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(SqliteStore::new(pool));
    let registry = Arc::new(CircuitBreakerRegistry::new(
        config.circuit.clone(),
        Arc::clone(&clock),
    ));
    let client = DeliveryClient::new(&config.user_agent)?;
    let shutdown_timeout = config.shutdown_timeout;

    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        store,
        registry,
        client,
        clock,
        config,
    ));
    let workers = WorkerPool::start(Arc::clone(&dispatcher));

    let state = AppState {
        dispatcher,
        admin_api_token,
    };
    let app = handlers::router(state);

    let addr: SocketAddr = bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "courier listening");

    let shutdown = workers.cancellation_token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(err) = result {
                        error!(error = %err, "failed to listen for shutdown signal");
                    }
                }
                () = shutdown.cancelled() => {}
            }
        })
        .await?;

    workers.shutdown(shutdown_timeout).await?;
    info!("courier stopped");

    Ok(())
}
