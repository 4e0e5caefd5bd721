//! Database utilities and connection management

use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::{str::FromStr, time::Duration};

use crate::error::FlaglaneResult;

/// Create a database connection pool
/// Note: Disables statement cache for PgBouncer compatibility
/// Uses conservative connection limits so the worker stays within the shared
/// pooler budget (one pass at a time needs very few connections)
pub async fn create_pool(database_url: &str) -> FlaglaneResult<PgPool> {
    // Parse connection options and disable prepared statement cache
    // PgBouncer in transaction mode doesn't support prepared statements
    let options = PgConnectOptions::from_str(database_url)?.statement_cache_capacity(0);

    let pool = PgPoolOptions::new()
        .max_connections(3)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(60)) // Release idle connections faster
        .max_lifetime(Duration::from_secs(300)) // Recycle connections more frequently
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> FlaglaneResult<()> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}
