#[path = "../src/db/migrations.rs"]
mod migrations;
#[path = "../src/db/pool.rs"]
mod pool;

use pool::{check_pool_health, create_pg_pool, PoolConfig};
use sqlx::PgPool;

const TEST_DATABASE_URL_ENV: &str = "FIELDNOTES_RELAY_TEST_DATABASE_URL";

async fn test_pool() -> Option<PgPool> {
    let Some(database_url) = std::env::var(TEST_DATABASE_URL_ENV).ok() else {
        eprintln!("skipping db integration test: set {TEST_DATABASE_URL_ENV} to run it");
        return None;
    };

    let config = PoolConfig { min_connections: 1, max_connections: 2, ..PoolConfig::default() };
    let pool =
        create_pg_pool(&database_url, config).await.expect("pool should connect to test database");
    Some(pool)
}

#[tokio::test]
async fn pg_pool_connects_and_passes_health_check() {
    let Some(pool) = test_pool().await else { return };
    check_pool_health(&pool).await.expect("health check query should succeed");
}

#[tokio::test]
async fn migrations_create_field_notes_table() {
    let Some(pool) = test_pool().await else { return };
    migrations::run_migrations(&pool).await.expect("migrations should apply");
    // Applying twice is a no-op.
    migrations::run_migrations(&pool).await.expect("migrations should re-apply");

    let columns: Vec<String> = sqlx::query_scalar::<_, String>(
        "SELECT column_name \
         FROM information_schema.columns \
         WHERE table_schema = 'public' AND table_name = 'field_notes'",
    )
    .fetch_all(&pool)
    .await
    .expect("column lookup should succeed");

    for expected in ["id", "parcel_id", "text", "created_at", "created_by", "user_id"] {
        assert!(
            columns.iter().any(|name| name == expected),
            "expected column `{expected}` on field_notes"
        );
    }
}
