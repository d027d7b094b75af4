//! BetVault - betting exchange money-movement core
//!
//! Wires the ledger, bet lifecycle, provider callbacks, settlement scanner
//! and job queue together and serves the HTTP API. Every service is
//! constructed here and passed down explicitly; no module holds global
//! state.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use betvault_backend::api::{create_router, AppState};
use betvault_backend::bets::{BetRepository, PlacementService};
use betvault_backend::config::{Config, DEV_MERCHANT_SECRET};
use betvault_backend::db;
use betvault_backend::ledger::LedgerStore;
use betvault_backend::odds::{OddsApi, OddsProviderClient};
use betvault_backend::provider::{CallbackService, SignatureVerifier};
use betvault_backend::queue::{JobHandler, JobQueue, QueueWorker};
use betvault_backend::settlement::{ResultDeclarer, SettlementJobHandler, SettlementScanner};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env()?;
    info!("🎰 BetVault exchange core starting");
    if config.merchant_secret == DEV_MERCHANT_SECRET {
        warn!("⚠️ MERCHANT_SECRET is the development default; set a real secret before accepting provider traffic");
    }

    let conn = db::open(&config.database_path)?;
    info!("💾 Database ready at: {}", config.database_path);

    let ledger = LedgerStore::new(conn.clone()).await?;
    let bets = BetRepository::new(conn.clone()).await?;
    let queue = JobQueue::new(
        conn.clone(),
        config.queue_max_attempts,
        config.queue_base_delay_secs,
    )
    .await?;

    let placement = PlacementService::new(
        conn.clone(),
        queue.clone(),
        config.placement_scan_delay_secs,
    );
    let verifier = SignatureVerifier::new(&config.merchant_id, &config.merchant_secret);
    let callbacks = CallbackService::new(ledger.clone(), verifier, &config.settlement_currency);

    let odds: Arc<dyn OddsApi> = Arc::new(
        OddsProviderClient::new(
            &config.provider_base_url,
            config.provider_api_key.as_deref(),
            config.provider_timeout_secs,
        )
        .context("Failed to build odds provider client")?,
    );

    let scanner = SettlementScanner::new(
        bets.clone(),
        odds,
        queue.clone(),
        config.result_recheck_secs,
    );
    let declarer = ResultDeclarer::new(conn.clone(), bets.clone());
    let handler: Arc<dyn JobHandler> =
        Arc::new(SettlementJobHandler::new(scanner.clone(), declarer));

    let workers = config.queue_workers.max(1);
    for _ in 0..workers {
        QueueWorker::new(queue.clone(), handler.clone()).spawn(config.queue_poll_secs);
    }
    info!(
        "🧵 {} queue workers polling every {}s",
        workers, config.queue_poll_secs
    );

    scanner.spawn(config.settlement_scan_secs);
    info!(
        "🔍 Settlement scanner running every {}s (first pass immediate)",
        config.settlement_scan_secs
    );

    let state = AppState {
        ledger,
        bets,
        placement,
        callbacks,
        queue,
        currency: config.settlement_currency.clone(),
    };
    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("🎯 API server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

/// Initialize tracing with env-based filtering
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "betvault=info,betvault_backend=debug,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
