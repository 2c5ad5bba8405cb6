use payments_api::app::{build_app, AppState};
use payments_api::config::AppConfig;
use payments_api::idempotency::{IdempotencyStore, InMemoryIdempotencyStore, StoreError};
use payments_api::ledger::Ledger;
use payments_api::metrics::Metrics;
use payments_api::postgres::PgIdempotencyStore;
use payments_api::reaper::IdempotencyReaper;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).json().init();
}

async fn open_store(config: &AppConfig) -> Result<Arc<dyn IdempotencyStore>, StoreError> {
    match config.database_url.as_deref() {
        Some(url) => {
            let store = PgIdempotencyStore::connect(url).await?;
            store.ensure_schema().await?;
            info!("idempotency store: postgres");
            Ok(Arc::new(store))
        }
        None => {
            info!("idempotency store: in-memory");
            Ok(Arc::new(InMemoryIdempotencyStore::new()))
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match AppConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            init_tracing("info");
            error!(error = %err, "configuration error");
            return ExitCode::from(1);
        }
    };
    init_tracing(&config.log_level);
    info!(version = env!("CARGO_PKG_VERSION"), "payments-api starting");

    let store = match open_store(&config).await {
        Ok(store) => store,
        Err(err) => {
            error!(error = %err, "failed to open idempotency store");
            return ExitCode::from(1);
        }
    };

    let metrics = Arc::new(Metrics::new());
    let reaper = IdempotencyReaper::start(
        Arc::clone(&store),
        config.idempotency.clone(),
        Arc::clone(&metrics),
    );
    let state = AppState::new(
        Arc::new(Ledger::seeded(chrono::Utc::now())),
        store,
        config.idempotency.clone(),
        &config.rate_limit,
        metrics,
    );
    let app = build_app(state);

    let addr = config.listen_addr();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, addr = %addr, "failed to bind");
            reaper.stop().await;
            return ExitCode::from(1);
        }
    };
    info!(addr = %addr, "listening");

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown signal received");
    };
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await;

    reaper.stop().await;
    match served {
        Ok(()) => {
            info!("shutdown complete");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!(error = %err, "server error");
            ExitCode::from(1)
        }
    }
}
