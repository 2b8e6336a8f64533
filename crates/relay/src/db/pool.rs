// Postgres pool backing the live store.
//
// Sizing is read from `WEBINAR_RELAY_DB_*`. `open_live_store_pool` connects,
// applies the `live_rows` migration and checks the table answers before the
// engine is handed the pool.

use std::{env, time::Duration};

use anyhow::{bail, Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use sqlx::PgPool;
use tracing::info;

use super::migrations::run_migrations;

const DEFAULT_MIN_CONNECTIONS: u32 = 2;
const DEFAULT_MAX_CONNECTIONS: u32 = 20;
const DEFAULT_ACQUIRE_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePoolConfig {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for StorePoolConfig {
    fn default() -> Self {
        Self {
            min_connections: DEFAULT_MIN_CONNECTIONS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_secs(DEFAULT_ACQUIRE_TIMEOUT_SECS),
        }
    }
}

impl StorePoolConfig {
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| env::var(key).ok())
    }

    pub fn from_env_fn(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let number = |key: &str| lookup(key).and_then(|value| value.trim().parse::<u64>().ok());

        let min_connections = number("WEBINAR_RELAY_DB_MIN_CONNECTIONS")
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(DEFAULT_MIN_CONNECTIONS);
        let max_connections = number("WEBINAR_RELAY_DB_MAX_CONNECTIONS")
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(DEFAULT_MAX_CONNECTIONS)
            .max(min_connections)
            .max(1);
        let acquire_timeout_secs =
            number("WEBINAR_RELAY_DB_ACQUIRE_TIMEOUT_SECS").unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_SECS);

        Self {
            min_connections,
            max_connections,
            acquire_timeout: Duration::from_secs(acquire_timeout_secs),
        }
    }
}

pub async fn create_pg_pool(database_url: &str, config: &StorePoolConfig) -> Result<PgPool> {
    let connect_options = database_url
        .parse::<PgConnectOptions>()
        .context("failed to parse live store PostgreSQL connection options")?;
    ensure_postgres_tls(&connect_options)?;

    PgPoolOptions::new()
        .min_connections(config.min_connections)
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(connect_options)
        .await
        .context("failed to connect to live store PostgreSQL")
}

/// Connect, migrate and verify `live_rows` is reachable.
pub async fn open_live_store_pool(database_url: &str, config: &StorePoolConfig) -> Result<PgPool> {
    let pool = create_pg_pool(database_url, config).await?;
    run_migrations(&pool).await?;
    let rows = count_live_rows(&pool).await?;
    info!(
        rows,
        max_connections = config.max_connections,
        "live store PostgreSQL ready"
    );
    Ok(pool)
}

/// Row count of `live_rows`; fails when the table is missing.
pub async fn count_live_rows(pool: &PgPool) -> Result<i64> {
    sqlx::query_scalar::<_, i64>("SELECT count(*) FROM live_rows")
        .fetch_one(pool)
        .await
        .context("live_rows is not readable; are migrations applied?")
}

/// Remote databases must use TLS; loopback hosts are exempt for local development.
fn ensure_postgres_tls(options: &PgConnectOptions) -> Result<()> {
    if is_loopback_host(options.get_host()) {
        return Ok(());
    }

    match options.get_ssl_mode() {
        PgSslMode::Require | PgSslMode::VerifyCa | PgSslMode::VerifyFull => Ok(()),
        mode => bail!(
            "live store PostgreSQL connection must require TLS; got sslmode={mode:?}. Set sslmode=require (or stricter)."
        ),
    }
}

fn is_loopback_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "::1") || host.starts_with('/')
}
