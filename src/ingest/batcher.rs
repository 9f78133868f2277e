// =============================================================================
// Snapshot batcher — single consumer of the ingestion channel
// =============================================================================
//
// Exactly one task reads the fan-in channel, so per-trader application order
// is this task's arrival order: no event races another into the state map.
// Each state-mutating event leaves behind a derived snapshot in the outbound
// buffer, which is flushed as one multi-row upsert every 30 seconds or at
// 1 000 buffered rows, whichever comes first.
//
// A database failure keeps the buffer: rows are retried on the next tick,
// and a newer snapshot for the same (trader, timestamp) key supersedes the
// stale one rather than queueing behind it.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::ingest::IngestEvent;
use crate::pnl::calc;
use crate::types::{DiscoverySource, PnlSnapshot, Trade};

/// Flush cadence for the outbound snapshot buffer.
const FLUSH_INTERVAL: Duration = Duration::from_secs(30);

/// Buffer size that forces an early flush.
const FLUSH_THRESHOLD: usize = 1_000;

pub struct SnapshotBatcher {
    app: Arc<AppState>,
    /// Outbound rows keyed by (trader_id, timestamp); duplicates keep the
    /// last writer, which is also the upsert's conflict semantics.
    buffer: HashMap<(i64, DateTime<Utc>), PnlSnapshot>,
}

impl SnapshotBatcher {
    pub fn new(app: Arc<AppState>) -> Self {
        Self {
            app,
            buffer: HashMap::new(),
        }
    }

    /// Consume events until shutdown; flush once more on the way out.
    pub async fn run(
        mut self,
        mut events_rx: mpsc::Receiver<IngestEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("snapshot batcher starting");
        let mut ticker = interval(FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = events_rx.recv() => {
                    match event {
                        Some(event) => {
                            self.handle(event).await;
                            if self.buffer.len() >= FLUSH_THRESHOLD {
                                self.flush().await;
                            }
                        }
                        None => break, // all producers gone
                    }
                }
                _ = ticker.tick() => self.flush().await,
                _ = shutdown.changed() => break,
            }
        }

        self.flush().await;
        info!("snapshot batcher stopped");
    }

    // -------------------------------------------------------------------------
    // Event handling
    // -------------------------------------------------------------------------

    async fn handle(&mut self, event: IngestEvent) {
        let address = event.address().to_string();

        // A trader row and zero state exist for every subscribed address;
        // an on-demand or race-window event creates them here instead of
        // being dropped.
        if !self.app.store.contains(&address) {
            match self
                .app
                .db
                .upsert_trader(&address, &DiscoverySource::ApiRequest.to_string())
                .await
            {
                Ok(trader) => self.app.store.initialize(trader.id, &address),
                Err(e) => {
                    error!(address = %address, error = %e, "trader row creation failed, event dropped");
                    return;
                }
            }
        }

        match event {
            IngestEvent::Fill { address, trade } => self.on_fill(&address, trade).await,
            IngestEvent::MarketFill {
                address,
                coin,
                side,
                price,
                size,
                timestamp,
                tid,
                tx_hash,
            } => {
                self.on_market_fill(&address, &coin, side, price, size, timestamp, tid, tx_hash)
                    .await
            }
            IngestEvent::Snapshot {
                address,
                clearinghouse,
            } => self.on_snapshot(&address, clearinghouse),
            IngestEvent::Funding { address, payments } => {
                self.on_funding(&address, payments).await
            }
        }
    }

    /// Authoritative fill: dedup, fold into aggregates, persist the row,
    /// leave a snapshot behind.
    async fn on_fill(&mut self, address: &str, trade: Trade) {
        if !self.app.store.mark_tid(address, trade.tid) {
            AppState::bump(&self.app.duplicate_fills_dropped);
            return;
        }

        let state = self.app.store.with_state(address, |state| {
            calc::apply_trade(state, &trade);
            calc::update_position_from_fill(state, &trade.coin, trade.side, trade.size, trade.price);
            state.clone()
        });

        let Some(state) = state else { return };
        AppState::bump(&self.app.fills_applied);
        self.persist_trade(state.trader_id, trade);
        self.buffer_snapshot(calc::create_snapshot(&state, None, Utc::now()));
    }

    /// Market-trade participation: the fill is synthesized here, against the
    /// state current at application time, then treated like a fill.
    #[allow(clippy::too_many_arguments)]
    async fn on_market_fill(
        &mut self,
        address: &str,
        coin: &str,
        side: crate::types::Side,
        price: rust_decimal::Decimal,
        size: rust_decimal::Decimal,
        timestamp: DateTime<Utc>,
        tid: i64,
        tx_hash: Option<String>,
    ) {
        if !self.app.store.mark_tid(address, tid) {
            AppState::bump(&self.app.duplicate_fills_dropped);
            return;
        }

        let result = self.app.store.with_state(address, |state| {
            let fill = calc::compute_fill_from_market_trade(
                state, coin, price, size, side, timestamp, tid, tx_hash,
            );
            calc::apply_trade(state, &fill);
            calc::update_position_from_fill(state, coin, side, size, price);
            (state.clone(), fill)
        });

        let Some((state, fill)) = result else { return };
        AppState::bump(&self.app.market_fills_applied);
        self.persist_trade(state.trader_id, fill);
        self.buffer_snapshot(calc::create_snapshot(&state, None, Utc::now()));
    }

    /// Authoritative positions + account value from the poll loop.
    fn on_snapshot(
        &mut self,
        address: &str,
        clearinghouse: crate::upstream::messages::ClearinghouseState,
    ) {
        let positions = match clearinghouse.positions() {
            Ok(p) => p,
            Err(e) => {
                warn!(address = %address, error = %e, "unparseable clearinghouse positions, skipped");
                return;
            }
        };
        let account_value = clearinghouse.account_value().ok();

        let state = self.app.store.with_state(address, |state| {
            calc::update_positions(state, positions);
            state.clone()
        });

        let Some(state) = state else { return };
        AppState::bump(&self.app.snapshot_events);
        self.buffer_snapshot(calc::create_snapshot(&state, account_value, Utc::now()));
    }

    /// Funding payments from the reconciliation loop.
    async fn on_funding(&mut self, address: &str, payments: Vec<crate::types::FundingPayment>) {
        if payments.is_empty() {
            return;
        }

        let state = self.app.store.with_state(address, |state| {
            for payment in &payments {
                calc::apply_funding(state, payment);
            }
            state.clone()
        });

        let Some(state) = state else { return };
        AppState::bump(&self.app.funding_events);

        let db = self.app.db.clone();
        let trader_id = state.trader_id;
        tokio::spawn(async move {
            if let Err(e) = db.insert_funding(trader_id, &payments).await {
                warn!(trader_id, error = %e, "funding row persistence failed");
            }
        });

        self.buffer_snapshot(calc::create_snapshot(&state, None, Utc::now()));
    }

    // -------------------------------------------------------------------------
    // Persistence
    // -------------------------------------------------------------------------

    /// Trade rows are best-effort and non-blocking: the state is already
    /// applied, and the insert is idempotent if a backfill rewrites it.
    fn persist_trade(&self, trader_id: i64, trade: Trade) {
        let db = self.app.db.clone();
        tokio::spawn(async move {
            if let Err(e) = db.insert_trades(trader_id, &[trade]).await {
                warn!(trader_id, error = %e, "trade row persistence failed");
            }
        });
    }

    fn buffer_snapshot(&mut self, snapshot: PnlSnapshot) {
        self.buffer
            .insert((snapshot.trader_id, snapshot.timestamp), snapshot);
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let rows: Vec<PnlSnapshot> = self.buffer.values().cloned().collect();
        match self.app.db.upsert_snapshots(&rows).await {
            Ok(written) => {
                debug!(written, "snapshot batch flushed");
                self.app
                    .snapshots_flushed
                    .fetch_add(rows.len() as u64, std::sync::atomic::Ordering::Relaxed);
                self.buffer.clear();
            }
            Err(e) => {
                error!(error = %e, buffered = self.buffer.len(),
                       "snapshot flush failed, buffer retained");
            }
        }
    }
}

impl std::fmt::Debug for SnapshotBatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotBatcher")
            .field("buffered", &self.buffer.len())
            .finish()
    }
}
