use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

use crate::config::Config;

/// Build the shared connection pool. Workers and request handlers all borrow
/// connections per operation; nothing long-lived holds one.
pub async fn connect(config: &Config) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(16)
        .connect(&config.database_url())
        .await?;
    tracing::info!(
        "connected to timescale at {}:{}/{}",
        config.timescale_host,
        config.timescale_port,
        config.timescale_dbname,
    );
    Ok(pool)
}
