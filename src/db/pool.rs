use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

/// Lazily connecting pool; an unreachable database surfaces when a run
/// acquires its session.
pub fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(5))
        .connect_lazy(database_url)?;

    tracing::info!(max_connections, "Database connection pool created");

    Ok(pool)
}
