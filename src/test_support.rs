// Shared test fixtures.
//
// The Postgres-backed tests are #[ignore]d: they need a disposable database.
// Run with: DATABASE_URL=postgres://... cargo test -- --ignored

use rust_decimal::Decimal;
use sqlx::PgPool;
use std::time::Duration;
use tokio::sync::OnceCell;

use crate::config::ProviderConfig;
use crate::db::Database;

// Concurrent CREATE TABLE IF NOT EXISTS on a fresh database can collide in
// pg_type, so the schema is created once per test binary.
static MIGRATED: OnceCell<()> = OnceCell::const_new();

pub async fn pg_pool() -> PgPool {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must point to a test database");
    let db = Database::connect(&url).await.expect("db connect");
    MIGRATED
        .get_or_init(|| async { db.run_migrations().await.expect("migrations") })
        .await;
    db.pool()
}

pub async fn insert_client(pool: &PgPool) -> i64 {
    let email = format!("client-{}@boutique.test", uuid::Uuid::new_v4());
    let row: (i64,) =
        sqlx::query_as("INSERT INTO clients (name, email) VALUES ('Test', $1) RETURNING id")
            .bind(email)
            .fetch_one(pool)
            .await
            .expect("insert client");
    row.0
}

pub async fn insert_product(pool: &PgPool, price: Decimal, stock: i32) -> i64 {
    let row: (i64,) = sqlx::query_as(
        "INSERT INTO products (name, price, stock) VALUES ('Test product', $1, $2) RETURNING id",
    )
    .bind(price)
    .bind(stock)
    .fetch_one(pool)
    .await
    .expect("insert product");
    row.0
}

pub async fn stock(pool: &PgPool, product_id: i64) -> i32 {
    let row: (i32,) = sqlx::query_as("SELECT stock FROM products WHERE id = $1")
        .bind(product_id)
        .fetch_one(pool)
        .await
        .expect("read stock");
    row.0
}

/// Provider settings pointed at a mock server, with short timers
pub fn provider_config(base_url: &str) -> ProviderConfig {
    ProviderConfig {
        base_url: base_url.trim_end_matches('/').to_string(),
        account_id: "ACC_0001".into(),
        password: "hunter2".into(),
        secret_callback_code: "SECRET01".into(),
        callback_code: "CB001".into(),
        redirect_success_code: Some("OK001".into()),
        redirect_failed_code: Some("KO001".into()),
        agent: "AGENT-1".into(),
        renew_path: "WPORYY2HIGCKDZWX/renew-secret".into(),
        rest_path: "FH9WCKEIPITSHCY0/rest".into(),
        link_path: "ZRS0VFCPA0YJUCFV/link".into(),
        callback_timeout: Duration::from_secs(2),
        secret_grace_period: Duration::from_millis(50),
    }
}
