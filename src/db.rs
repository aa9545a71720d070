use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub async fn init_pool(database_url: &str) -> Result<Pool<Postgres>, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(env_u64("DB_MAX_CONNECTIONS", 20) as u32)
        .min_connections(env_u64("DB_MIN_CONNECTIONS", 5) as u32)
        .acquire_timeout(Duration::from_secs(env_u64("DB_ACQUIRE_TIMEOUT_SECS", 10)))
        .idle_timeout(Duration::from_secs(env_u64("DB_IDLE_TIMEOUT_SECS", 600)))
        .max_lifetime(Duration::from_secs(env_u64("DB_MAX_LIFETIME_SECS", 1800)))
        .connect(database_url)
        .await
}
