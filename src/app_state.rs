// =============================================================================
// Central application state — shared handles and operational counters
// =============================================================================
//
// Built once at boot and passed by Arc to every task; nothing here relies on
// module-scope initialization order. Counters are plain atomics: the stats
// endpoint reads them lock-free and slightly stale values are fine.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use crate::config::Config;
use crate::ingest::backfill::BackfillScheduler;
use crate::ingest::hybrid::HybridStream;
use crate::store::db::Database;
use crate::store::trader_state::TraderStateStore;
use crate::upstream::http::InfoClient;
use crate::upstream::rate_limit::{RateBudget, RateBudgetSnapshot};
use crate::upstream::ws::{ConnState, WsClient};

/// Shared state for all tasks and the read API.
pub struct AppState {
    pub config: Config,
    pub db: Database,
    pub store: Arc<TraderStateStore>,
    pub budget: Arc<RateBudget>,
    pub info: InfoClient,
    pub ws: WsClient,
    pub hybrid: Arc<HybridStream>,
    pub backfill: BackfillScheduler,

    // ── Operational counters ────────────────────────────────────────────
    pub fills_applied: AtomicU64,
    pub market_fills_applied: AtomicU64,
    pub duplicate_fills_dropped: AtomicU64,
    pub snapshot_events: AtomicU64,
    pub funding_events: AtomicU64,
    pub snapshots_flushed: AtomicU64,
    pub discoveries_enqueued: AtomicU64,

    pub start_time: std::time::Instant,
}

/// Payload for `GET /api/v1/stats`.
#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub tracked_traders: usize,
    pub ws_state: ConnState,
    pub ws_user_fill_subscriptions: usize,
    pub rate_budget: RateBudgetSnapshot,
    pub fills_applied: u64,
    pub market_fills_applied: u64,
    pub duplicate_fills_dropped: u64,
    pub snapshot_events: u64,
    pub funding_events: u64,
    pub snapshots_flushed: u64,
    pub discoveries_enqueued: u64,
}

impl AppState {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stats(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.start_time.elapsed().as_secs(),
            tracked_traders: self.store.tracked_count(),
            ws_state: self.ws.state(),
            ws_user_fill_subscriptions: self.ws.user_fills_count(),
            rate_budget: self.budget.snapshot(),
            fills_applied: self.fills_applied.load(Ordering::Relaxed),
            market_fills_applied: self.market_fills_applied.load(Ordering::Relaxed),
            duplicate_fills_dropped: self.duplicate_fills_dropped.load(Ordering::Relaxed),
            snapshot_events: self.snapshot_events.load(Ordering::Relaxed),
            funding_events: self.funding_events.load(Ordering::Relaxed),
            snapshots_flushed: self.snapshots_flushed.load(Ordering::Relaxed),
            discoveries_enqueued: self.discoveries_enqueued.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("tracked", &self.store.tracked_count())
            .field("ws_state", &self.ws.state())
            .finish()
    }
}
