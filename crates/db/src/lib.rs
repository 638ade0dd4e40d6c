pub mod bulk_jobs;
pub mod connections;
pub mod memory;
pub mod records;

use lumen_common::error::{LumenError, LumenResult};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Create a Postgres connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> LumenResult<PgPool> {
    tracing::info!("connecting to database");
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| LumenError::Database(e.to_string()))
}

/// Apply the embedded schema migrations.
pub async fn run_migrations(pool: &PgPool) -> LumenResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| LumenError::Database(e.to_string()))?;
    tracing::info!("database migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_pool_fails_with_invalid_url() {
        let result = create_pool("postgres://invalid:5432/nonexistent").await;
        assert!(result.is_err());
    }
}
