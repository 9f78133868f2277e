// =============================================================================
// Perp PnL Indexer — Main Entry Point
// =============================================================================
//
// Boot order matters: configuration and migrations are the only fatal
// failures (exit 1). Once the shared components exist, every long-lived loop
// is its own spawned task wired to one shutdown watch channel; ingestion
// errors after boot are transient by policy and never take the process down.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod config;
mod ingest;
mod pnl;
mod store;
mod types;
mod upstream;

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::Config;
use crate::ingest::autosub::AutoSubscribeWorker;
use crate::ingest::backfill::{BackfillScheduler, BackfillWorker};
use crate::ingest::batcher::SnapshotBatcher;
use crate::ingest::capture::MarketCapture;
use crate::ingest::gaps::GapDetector;
use crate::ingest::hybrid::HybridStream;
use crate::ingest::IngestEvent;
use crate::store::db::Database;
use crate::store::trader_state::TraderStateStore;
use crate::types::TraderState;
use crate::upstream::http::InfoClient;
use crate::upstream::rate_limit::RateBudget;
use crate::upstream::ws::WsClient;

/// Depth of the fan-in channel feeding the snapshot batcher. Producers
/// suspend when the batcher falls this far behind.
const EVENT_CHANNEL_DEPTH: usize = 4_096;

/// Grace period for draining tasks after the shutdown signal.
const SHUTDOWN_GRACE: std::time::Duration = std::time::Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // ── 1. Environment & logging ─────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║           Perp PnL Indexer — Starting Up                ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    // ── 2. Configuration (fatal on invalid) ──────────────────────────────
    let config = Config::from_env().context("invalid configuration")?;

    // ── 3. Database + migrations (fatal on failure) ──────────────────────
    let db = Database::connect(&config.database_url, config.db_max_connections).await?;

    // ── 4. Shared components ─────────────────────────────────────────────
    let budget = Arc::new(RateBudget::new());
    let info_client = InfoClient::new(&config.upstream_base_url, budget.clone());
    let (ws, ws_runner) = WsClient::new(&config.websocket_url, budget.clone());
    let store = Arc::new(TraderStateStore::new());

    let (events_tx, events_rx) = mpsc::channel::<IngestEvent>(EVENT_CHANNEL_DEPTH);

    let hybrid = Arc::new(HybridStream::new(
        ws.clone(),
        info_client.clone(),
        store.clone(),
        events_tx.clone(),
        config.use_hybrid_mode,
        config.poll_interval,
        config.funding_poll_interval,
    ));

    let app = Arc::new(AppState {
        backfill: BackfillScheduler::new(db.clone()),
        config: config.clone(),
        db: db.clone(),
        store: store.clone(),
        budget: budget.clone(),
        info: info_client.clone(),
        ws: ws.clone(),
        hybrid: hybrid.clone(),
        fills_applied: AtomicU64::new(0),
        market_fills_applied: AtomicU64::new(0),
        duplicate_fills_dropped: AtomicU64::new(0),
        snapshot_events: AtomicU64::new(0),
        funding_events: AtomicU64::new(0),
        snapshots_flushed: AtomicU64::new(0),
        discoveries_enqueued: AtomicU64::new(0),
        start_time: std::time::Instant::now(),
    });

    // ── 5. Shutdown wiring ───────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 6. Spawn the task graph ──────────────────────────────────────────
    tokio::spawn(ws_runner.run(shutdown_rx.clone()));

    let batcher_handle = tokio::spawn(
        SnapshotBatcher::new(app.clone()).run(events_rx, shutdown_rx.clone()),
    );

    let capture = Arc::new(MarketCapture::new(
        ws.clone(),
        db.clone(),
        store.clone(),
        events_tx.clone(),
        app.clone(),
    ));
    let capture_shutdown = shutdown_rx.clone();
    tokio::spawn(async move {
        if let Err(e) = capture.run(capture_shutdown).await {
            error!(error = %e, "market capture failed");
        }
    });

    tokio::spawn(hybrid.clone().run_poll_loop(shutdown_rx.clone()));
    tokio::spawn(hybrid.clone().run_funding_loop(shutdown_rx.clone()));
    tokio::spawn(AutoSubscribeWorker::new(app.clone()).run(shutdown_rx.clone()));

    let backfill_handle =
        tokio::spawn(BackfillWorker::new(app.clone()).run(shutdown_rx.clone()));

    tokio::spawn(
        GapDetector::new(db.clone(), config.poll_interval).run(shutdown_rx.clone()),
    );

    // ── 7. Read API ──────────────────────────────────────────────────────
    let api_app = app.clone();
    let api_shutdown = shutdown_rx.clone();
    let bind_addr = format!("0.0.0.0:{}", config.port);
    tokio::spawn(async move {
        let router = api::rest::router(api_app);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(addr = %bind_addr, error = %e, "api bind failed");
                return;
            }
        };
        info!(addr = %bind_addr, "api server listening");
        let mut shutdown = api_shutdown;
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        });
        if let Err(e) = serve.await {
            error!(error = %e, "api server failed");
        }
    });

    // ── 8. Rehydrate tracked traders ─────────────────────────────────────
    match rehydrate(&app).await {
        Ok(count) => info!(count, "tracked traders rehydrated"),
        Err(e) => warn!(error = %e, "trader rehydration incomplete"),
    }

    info!("All subsystems running.");

    // ── 9. Signal wait & graceful shutdown ───────────────────────────────
    wait_for_signal().await;
    warn!("Shutdown signal received — stopping gracefully");
    let _ = shutdown_tx.send(true);
    drop(events_tx); // batcher drains producers, flushes, exits

    let drain = async {
        let _ = batcher_handle.await;
        let _ = backfill_handle.await;
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!("shutdown grace period elapsed with tasks still running");
    }

    info!("Perp PnL Indexer shut down complete.");
    Ok(())
}

/// Rebuild running state for active traders from the trade and funding
/// tables, then re-subscribe each one. Snapshots alone cannot seed the
/// positions map, so positions refill on the first clearinghouse poll.
async fn rehydrate(app: &Arc<AppState>) -> Result<usize> {
    let traders = app.db.active_traders().await?;
    let mut restored = 0usize;

    for trader in &traders {
        let ta = app.db.trade_aggregates(trader.id).await?;
        let fa = app.db.funding_aggregates(trader.id).await?;

        let mut state = TraderState::new(trader.id, &trader.address);
        state.realized_trading_pnl = ta.trading_pnl.unwrap_or_default();
        state.total_fees = ta.total_fees.unwrap_or_default();
        state.total_volume = ta.total_volume.unwrap_or_default();
        state.trade_count = ta.trade_count.max(0) as u64;
        state.liquidation_count = ta.liquidation_count.max(0) as u64;
        state.flip_count = ta.flip_count.max(0) as u64;
        state.realized_funding_pnl = fa.funding_pnl.unwrap_or_default();
        state.last_funding_time = fa.last_funding_at;
        state.last_updated = ta
            .last_trade_at
            .into_iter()
            .chain(fa.last_funding_at)
            .max()
            .unwrap_or(trader.first_seen_at);

        app.store.set(&trader.address, state);

        if let Err(e) = app.hybrid.subscribe(&trader.address).await {
            warn!(address = %trader.address, error = %e, "re-subscription failed");
            continue;
        }
        restored += 1;
    }

    Ok(restored)
}

/// SIGINT or SIGTERM, whichever lands first.
async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "sigterm handler install failed");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
