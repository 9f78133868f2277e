// =============================================================================
// Market-trade capture & discovery
// =============================================================================
//
// One WS `trades` subscription per coin in a small static list. Every trade
// names its two participants, which gives us two things:
//
//   discovery — addresses we have never seen get queued for auto-subscribe;
//   capture   — fills for *tracked* traders, including the ones past the
//               10-address userFills cap, synthesized from the trade itself.
//
// The coin list is static by design: it bounds the WS subscription count and
// keeps the budget spend predictable. Changing it is a redeploy.
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::ingest::IngestEvent;
use crate::store::db::Database;
use crate::store::trader_state::TraderStateStore;
use crate::types::{DiscoverySource, Side};
use crate::upstream::messages::{ms_to_datetime, parse_decimal, WireMarketTrade};
use crate::upstream::normalize_address;
use crate::upstream::ws::{Subscription, WsClient};

/// High-volume coins watched for discovery and fill capture.
pub const DISCOVERY_COINS: [&str; 8] =
    ["BTC", "ETH", "SOL", "DOGE", "XRP", "AVAX", "LINK", "ARB"];

/// Discovery inserts are buffered this long before one bulk enqueue.
const DISCOVERY_FLUSH_INTERVAL: Duration = Duration::from_secs(5);

pub struct MarketCapture {
    ws: WsClient,
    db: Database,
    store: Arc<TraderStateStore>,
    events_tx: mpsc::Sender<IngestEvent>,
    app: Arc<AppState>,
    /// Every address ever observed: traders ∪ discovery queue ∪ this run's
    /// finds. Membership here suppresses repeat discovery work.
    known: Mutex<HashSet<String>>,
    /// Discoveries awaiting the next bulk enqueue.
    pending: Mutex<Vec<String>>,
}

impl MarketCapture {
    pub fn new(
        ws: WsClient,
        db: Database,
        store: Arc<TraderStateStore>,
        events_tx: mpsc::Sender<IngestEvent>,
        app: Arc<AppState>,
    ) -> Self {
        Self {
            ws,
            db,
            store,
            events_tx,
            app,
            known: Mutex::new(HashSet::new()),
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Hydrate the known set, subscribe each coin, and run until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let known = self
            .db
            .known_addresses()
            .await
            .context("failed to hydrate known addresses")?;
        let count = known.len();
        *self.known.lock() = known.into_iter().collect();
        info!(known = count, coins = DISCOVERY_COINS.len(), "market capture starting");

        for coin in DISCOVERY_COINS {
            let rx = self
                .ws
                .subscribe(Subscription::Trades {
                    coin: coin.to_string(),
                })
                .await
                .with_context(|| format!("trades subscription for {coin} failed"))?;
            tokio::spawn(self.clone().consume_coin(coin, rx));
        }

        self.flush_discoveries_until(shutdown).await;
        Ok(())
    }

    /// Per-coin reader: parse each trades frame and process every trade.
    async fn consume_coin(
        self: Arc<Self>,
        coin: &'static str,
        mut rx: mpsc::Receiver<serde_json::Value>,
    ) {
        while let Some(data) = rx.recv().await {
            let trades: Vec<WireMarketTrade> = match serde_json::from_value(data) {
                Ok(t) => t,
                Err(e) => {
                    warn!(coin, error = %e, "malformed trades payload");
                    continue;
                }
            };
            for trade in trades {
                if let Err(e) = self.process_trade(&trade).await {
                    warn!(coin, tid = trade.tid, error = %e, "trade processing failed");
                }
            }
        }
        debug!(coin, "coin trade reader stopped");
    }

    /// Route one market trade: discovery for unknown participants, fill
    /// capture for tracked ones. `users` is `[buyer, seller]`.
    async fn process_trade(&self, trade: &WireMarketTrade) -> Result<()> {
        let participants = [(trade.buyer(), Side::Buy), (trade.seller(), Side::Sell)];

        for (user, our_side) in participants {
            let Some(raw) = user else { continue };
            let Ok(address) = normalize_address(raw) else {
                debug!(raw, "ignoring malformed participant address");
                continue;
            };

            if self.store.contains(&address) {
                self.capture_fill(&address, our_side, trade).await?;
            } else if self.known.lock().insert(address.clone()) {
                self.pending.lock().push(address);
            }
        }
        Ok(())
    }

    /// Forward a tracked trader's participation to the batcher, which
    /// synthesizes the fill against the state it holds at application time.
    async fn capture_fill(
        &self,
        address: &str,
        our_side: Side,
        trade: &WireMarketTrade,
    ) -> Result<()> {
        let event = IngestEvent::MarketFill {
            address: address.to_string(),
            coin: trade.coin.clone(),
            side: our_side,
            price: parse_decimal(&trade.px, "px")?,
            size: parse_decimal(&trade.sz, "sz")?,
            timestamp: ms_to_datetime(trade.time)?,
            tid: trade.tid,
            tx_hash: trade.hash.clone(),
        };
        self.events_tx
            .send(event)
            .await
            .context("event channel closed")?;
        Ok(())
    }

    /// Timer-driven bulk enqueue of buffered discoveries.
    async fn flush_discoveries_until(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(DISCOVERY_FLUSH_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            self.flush_discoveries().await;
        }
        // Last drain so finds from the final window survive the restart.
        self.flush_discoveries().await;
        info!("market capture stopped");
    }

    async fn flush_discoveries(&self) {
        let batch: Vec<String> = std::mem::take(&mut *self.pending.lock());
        if batch.is_empty() {
            return;
        }

        let items: Vec<(String, DiscoverySource, i32)> = batch
            .iter()
            .map(|a| (a.clone(), DiscoverySource::MarketTrade, 0))
            .collect();

        match self.db.enqueue_discoveries(&items).await {
            Ok(inserted) => {
                if inserted > 0 {
                    info!(inserted, buffered = batch.len(), "discoveries enqueued");
                }
                self.app
                    .discoveries_enqueued
                    .fetch_add(inserted, std::sync::atomic::Ordering::Relaxed);
            }
            Err(e) => {
                // Queue insert is idempotent; push the batch back and retry
                // on the next tick.
                error!(error = %e, count = batch.len(), "discovery enqueue failed, retrying");
                self.pending.lock().extend(batch);
            }
        }
    }
}

impl std::fmt::Debug for MarketCapture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MarketCapture")
            .field("known", &self.known.lock().len())
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}
