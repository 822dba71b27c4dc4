use std::time::Duration;

use anyhow::{bail, Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;

const DEFAULT_MIN_CONNECTIONS: u32 = 1;
const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 5;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl PoolConfig {
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let read = |key: &str| env(key).ok().and_then(|value| value.trim().parse::<u64>().ok());

        let min_connections = read("FIELDNOTES_RELAY_DB_MIN_CONNECTIONS")
            .map(|value| value as u32)
            .unwrap_or(DEFAULT_MIN_CONNECTIONS);
        let max_connections = read("FIELDNOTES_RELAY_DB_MAX_CONNECTIONS")
            .map(|value| value as u32)
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(min_connections.max(1));
        let acquire_timeout = Duration::from_secs(
            read("FIELDNOTES_RELAY_DB_ACQUIRE_TIMEOUT_SECS").unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        );

        Self { min_connections, max_connections, acquire_timeout }
    }
}

pub async fn create_pg_pool(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    let connect_options = database_url
        .parse::<PgConnectOptions>()
        .context("failed to parse field note PostgreSQL connection options")?;
    ensure_postgres_tls(&connect_options)?;

    PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(connect_options)
        .await
        .context("failed to connect to field note PostgreSQL")
}

pub async fn check_pool_health(pool: &PgPool) -> Result<()> {
    sqlx::query_scalar::<_, i32>("SELECT 1")
        .fetch_one(pool)
        .await
        .context("field note PostgreSQL health check failed")?;

    Ok(())
}

/// Remote databases must use TLS; a database on the loopback interface may not.
fn ensure_postgres_tls(options: &PgConnectOptions) -> Result<()> {
    if is_loopback_host(options.get_host()) {
        return Ok(());
    }

    match options.get_ssl_mode() {
        PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => Ok(()),
        mode => bail!(
            "field note PostgreSQL connection to a remote host must require TLS; got sslmode={mode:?}. Set sslmode=require (or stricter)."
        ),
    }
}

fn is_loopback_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]") || host.starts_with('/')
}
