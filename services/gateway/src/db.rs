use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

pub async fn create_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    // In-memory SQLite gives every pooled connection its own database, so
    // the memory URL is pinned to a single connection.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 10 };
    SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await
}

pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// Single-connection in-memory pool with migrations applied; test helper.
pub async fn create_test_pool() -> SqlitePool {
    let pool = create_pool("sqlite::memory:")
        .await
        .expect("failed to open in-memory SQLite");
    run_migrations(&pool)
        .await
        .expect("failed to run migrations");
    pool
}
