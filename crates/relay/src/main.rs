use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use webinar_relay::{
    api::AppState,
    auth::jwt::JwtHostTokenService,
    build_router,
    config::RelayConfig,
    db::pool::{open_live_store_pool, StorePoolConfig},
    engine::{EngineConfig, LiveEngine},
    metrics::{self, RelayMetrics},
    store::LiveStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set WEBINAR_RELAY_JWT_SECRET in production");
    }
    let jwt_service = Arc::new(
        JwtHostTokenService::new(&config.jwt_secret).context("invalid relay JWT secret")?,
    );

    let store = open_store(&config).await?;
    let engine = LiveEngine::init(store, EngineConfig::from_relay_config(&config)?)
        .context("failed to start live engine")?;

    let relay_metrics = Arc::new(RelayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&relay_metrics));

    let app = build_router(
        AppState { engine: Arc::clone(&engine), jwt_service, metrics: relay_metrics },
        config.cors_origins.as_deref(),
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting webinar relay");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly");
    engine.dispose().await;
    served
}

fn init_tracing(config: &RelayConfig) {
    let filter =
        EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn open_store(config: &RelayConfig) -> anyhow::Result<LiveStore> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("WEBINAR_RELAY_DATABASE_URL is not set; using the in-memory store");
        return Ok(LiveStore::memory());
    };

    let pool = open_live_store_pool(database_url, &StorePoolConfig::from_env())
        .await
        .context("failed to initialize live store PostgreSQL pool")?;
    Ok(LiveStore::postgres(pool))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
