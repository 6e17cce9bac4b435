#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

use std::{fs, sync::Arc, time::Duration};

use chrono::{DateTime, SubsecRound, Utc};
use courier::{
    circuit::CircuitBreakerRegistry,
    dispatcher::{DeliveryClient, Dispatcher, DispatcherConfig},
    store::SqliteStore,
    time::{Clock, ManualClock},
    types::{CreateWebhookRequest, Webhook},
};
use sqlx::{
    Connection, SqliteConnection, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tempfile::NamedTempFile;
use uuid::Uuid;

pub struct TestDb {
    pub pool: SqlitePool,
    _db_file: NamedTempFile,
}

pub async fn setup_db() -> TestDb {
    let db_file = NamedTempFile::new().expect("create temp sqlite file");
    let options = SqliteConnectOptions::new()
        .filename(db_file.path())
        .create_if_missing(true)
        .busy_timeout(Duration::from_secs(5));

    let mut conn = SqliteConnection::connect_with(&options)
        .await
        .expect("connect sqlite for migrations");
    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut conn)
        .await
        .expect("enable foreign keys");
    run_migrations(&mut conn).await.expect("run migrations");
    conn.close().await.expect("close migration conn");

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .after_connect(|conn, _| {
            Box::pin(async move {
                sqlx::query("PRAGMA foreign_keys = ON;")
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect_with(options)
        .await
        .expect("connect sqlite");

    TestDb {
        pool,
        _db_file: db_file,
    }
}

async fn run_migrations(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    let mut entries: Vec<_> = fs::read_dir("migrations")
        .map_err(sqlx::Error::Io)?
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().and_then(|ext| ext.to_str()) == Some("sql"))
        .collect();
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let contents = fs::read_to_string(entry.path()).map_err(sqlx::Error::Io)?;
        for stmt in contents.split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(&mut *conn).await?;
            }
        }
    }
    Ok(())
}

pub fn webhook_request(workspace_id: Uuid, url: &str, events: &[&str]) -> CreateWebhookRequest {
    CreateWebhookRequest {
        workspace_id,
        user_id: Uuid::new_v4(),
        url: url.to_string(),
        events: events.iter().map(|event| (*event).to_string()).collect(),
        secret: None,
        http_method: None,
        content_type: None,
        timeout_ms: Some(2_000),
        max_retries: None,
        retry_delay_ms: None,
        headers: None,
    }
}

pub fn webhook(workspace_id: Uuid, url: &str, events: &[&str], now: DateTime<Utc>) -> Webhook {
    Webhook::register(webhook_request(workspace_id, url, events), now)
}

pub struct Harness {
    pub db: TestDb,
    pub store: Arc<SqliteStore>,
    pub clock: ManualClock,
    pub dispatcher: Arc<Dispatcher>,
}

pub fn test_config() -> DispatcherConfig {
    DispatcherConfig {
        batch_size: 10,
        ..DispatcherConfig::default()
    }
}

pub async fn harness(config: DispatcherConfig) -> Harness {
    let db = setup_db().await;
    let store = Arc::new(SqliteStore::new(db.pool.clone()));
    // Stored timestamps keep milliseconds only.
    let clock = ManualClock::new(Utc::now().trunc_subsecs(3));
    let shared_clock: Arc<dyn Clock> = Arc::new(clock.clone());
    let registry = Arc::new(CircuitBreakerRegistry::new(
        config.circuit.clone(),
        Arc::clone(&shared_clock),
    ));
    let client = DeliveryClient::new("courier-tests").expect("build client");
    let dispatcher = Arc::new(Dispatcher::new(
        store.clone(),
        store.clone(),
        registry,
        client,
        shared_clock,
        config,
    ));

    Harness {
        db,
        store,
        clock,
        dispatcher,
    }
}
