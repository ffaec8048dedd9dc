//! API server entry point.

use std::sync::Arc;

use api::AppState;
use api::config::{Config, LogFormat};
use coordination::{
    DedupCache, InMemoryDedupCache, InMemoryLockService, LockService, RedisDedupCache,
    RedisLockService,
};
use ledger::{InMemoryLedger, Ledger, PostgresLedger};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::{HttpPaymentProvider, InMemoryPaymentProvider, PaymentProvider};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const DB_MAX_CONNECTIONS: u32 = 20;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    init_tracing(&config);

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(DB_MAX_CONNECTIONS)
                .connect(&url)
                .await
                .expect("failed to connect to Postgres");
            let ledger = PostgresLedger::new(pool).with_lock_wait(config.lock_wait);
            ledger
                .run_migrations()
                .await
                .expect("failed to run ledger migrations");
            tracing::info!("using Postgres ledger");
            with_coordination(config, metrics_handle, ledger).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory ledger");
            let ledger = InMemoryLedger::new().with_lock_wait(config.lock_wait);
            with_coordination(config, metrics_handle, ledger).await;
        }
    }
}

async fn with_coordination<L: Ledger>(config: Config, metrics: PrometheusHandle, ledger: L) {
    match config.redis_url.clone() {
        Some(url) => {
            let cache = RedisDedupCache::new(&url)
                .await
                .expect("failed to connect dedup cache to Redis");
            let locks = RedisLockService::new(&url)
                .await
                .expect("failed to connect lock service to Redis");
            tracing::info!("using Redis dedup cache and lease lock");
            with_provider(config, metrics, ledger, cache, locks).await;
        }
        None => {
            tracing::warn!("REDIS_URL not set, using in-process cache and locks");
            with_provider(
                config,
                metrics,
                ledger,
                InMemoryDedupCache::new(),
                InMemoryLockService::new(),
            )
            .await;
        }
    }
}

async fn with_provider<L, C, K>(config: Config, metrics: PrometheusHandle, ledger: L, cache: C, locks: K)
where
    L: Ledger,
    C: DedupCache,
    K: LockService,
{
    match config.payment_secret_key.clone() {
        Some(secret) => {
            let provider =
                HttpPaymentProvider::new(&config.payment_base_url, secret, config.payment_timeout)
                    .expect("failed to build payment client");
            tracing::info!(base_url = %config.payment_base_url, "using HTTP payment provider");
            serve(config, metrics, ledger, cache, locks, provider).await;
        }
        None => {
            tracing::warn!("PAYMENT_SECRET_KEY not set, every payment will be approved in-process");
            serve(config, metrics, ledger, cache, locks, InMemoryPaymentProvider::new()).await;
        }
    }
}

async fn serve<L, C, K, P>(
    config: Config,
    metrics: PrometheusHandle,
    ledger: L,
    cache: C,
    locks: K,
    provider: P,
) where
    L: Ledger,
    C: DedupCache,
    K: LockService,
    P: PaymentProvider,
{
    let state = Arc::new(AppState::new(&config, ledger, cache, locks, provider));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let background = state.spawn_background(&config, shutdown_rx);

    let app = api::create_app(state, metrics);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    let _ = shutdown_tx.send(true);
    for task in background {
        if let Err(e) = task.await {
            tracing::warn!(error = %e, "background task ended abnormally");
        }
    }

    tracing::info!("server shut down gracefully");
}
