// =============================================================================
// Hybrid ingestion stream — push fills + pull snapshots, one fan-in channel
// =============================================================================
//
// Two sources cover every tracked trader:
//
//   push: per-address `userFills` WS subscriptions — lowest latency, but the
//         upstream caps them at ten addresses per connection;
//   pull: periodic `clearinghouseState` polls — authoritative positions and
//         account value for everyone, including traders past the WS cap.
//
// Traders beyond the cap are "polling-only": the market-trade capture module
// still sees their fills on the coin channels, so nothing is lost, only
// fee/closedPnl fidelity until the next reconciliation.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::ingest::IngestEvent;
use crate::store::trader_state::TraderStateStore;
use crate::upstream::http::InfoClient;
use crate::upstream::messages::WsUserFills;
use crate::upstream::ws::{Subscription, WsClient, USER_FILLS_CAP};
use crate::upstream::{normalize_address, UpstreamError};

/// Delay before the first poll round, letting WS subscriptions settle.
const POLL_BOOT_DELAY: Duration = Duration::from_secs(10);

/// Addresses per poll dispatch batch.
const POLL_BATCH: usize = 10;

/// Gap between poll batches.
const POLL_BATCH_GAP: Duration = Duration::from_secs(3);

/// Delay before the first funding round.
const FUNDING_BOOT_DELAY: Duration = Duration::from_secs(60);

/// Pause between per-trader funding fetches within a round.
const FUNDING_ITEM_GAP: Duration = Duration::from_millis(250);

/// How a tracked trader receives its fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillDelivery {
    WsFills,
    PollingOnly,
}

/// The hybrid stream: subscription admission plus the two poll loops.
pub struct HybridStream {
    ws: WsClient,
    info: InfoClient,
    store: Arc<TraderStateStore>,
    events_tx: mpsc::Sender<IngestEvent>,
    use_hybrid_mode: bool,
    poll_interval: Duration,
    funding_poll_interval: Duration,
    subscribed: Mutex<HashMap<String, FillDelivery>>,
    last_snapshot_at: Mutex<HashMap<String, Instant>>,
}

impl HybridStream {
    pub fn new(
        ws: WsClient,
        info: InfoClient,
        store: Arc<TraderStateStore>,
        events_tx: mpsc::Sender<IngestEvent>,
        use_hybrid_mode: bool,
        poll_interval: Duration,
        funding_poll_interval: Duration,
    ) -> Self {
        Self {
            ws,
            info,
            store,
            events_tx,
            use_hybrid_mode,
            poll_interval,
            funding_poll_interval,
            subscribed: Mutex::new(HashMap::new()),
            last_snapshot_at: Mutex::new(HashMap::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Admission
    // -------------------------------------------------------------------------

    /// Start tracking `address`. Idempotent. The caller must have created
    /// the trader row and initialized store state first.
    pub async fn subscribe(self: &Arc<Self>, address: &str) -> Result<FillDelivery, UpstreamError> {
        let address = normalize_address(address)?;

        if let Some(mode) = self.subscribed.lock().get(&address) {
            return Ok(*mode);
        }

        let mode = if self.use_hybrid_mode && self.ws.user_fills_count() < USER_FILLS_CAP {
            match self
                .ws
                .subscribe(Subscription::UserFills {
                    user: address.clone(),
                })
                .await
            {
                Ok(rx) => {
                    self.spawn_fill_reader(address.clone(), rx);
                    FillDelivery::WsFills
                }
                Err(e) => {
                    // Races on the last WS slot land here; polling covers it.
                    warn!(address = %address, error = %e, "ws fill subscription failed, polling only");
                    FillDelivery::PollingOnly
                }
            }
        } else {
            FillDelivery::PollingOnly
        };

        self.subscribed.lock().insert(address.clone(), mode);
        info!(address = %address, ?mode, "trader subscribed");
        Ok(mode)
    }

    /// Stop tracking `address`: WS subscription dropped, poll registration
    /// removed, in-memory state released.
    pub async fn unsubscribe(&self, address: &str) {
        let Ok(address) = normalize_address(address) else {
            return;
        };
        let mode = self.subscribed.lock().remove(&address);
        if mode == Some(FillDelivery::WsFills) {
            self.ws
                .unsubscribe(&Subscription::UserFills {
                    user: address.clone(),
                })
                .await;
        }
        self.last_snapshot_at.lock().remove(&address);
        self.store.remove(&address);
        info!(address = %address, "trader unsubscribed");
    }

    pub fn is_subscribed(&self, address: &str) -> bool {
        self.subscribed.lock().contains_key(address)
    }

    pub fn subscribed_count(&self) -> usize {
        self.subscribed.lock().len()
    }

    fn subscribed_addresses(&self) -> Vec<String> {
        self.subscribed.lock().keys().cloned().collect()
    }

    // -------------------------------------------------------------------------
    // Push path
    // -------------------------------------------------------------------------

    /// One reader task per WS fill subscription. Terminates when the queue
    /// closes (unsubscribe). Tid deduplication happens at the batcher, which
    /// owns state application order.
    fn spawn_fill_reader(
        self: &Arc<Self>,
        address: String,
        mut rx: mpsc::Receiver<serde_json::Value>,
    ) {
        let events_tx = self.events_tx.clone();
        tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                let payload: WsUserFills = match serde_json::from_value(data) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(address = %address, error = %e, "malformed userFills payload");
                        continue;
                    }
                };
                // The initial snapshot message replays recent history; the
                // tid window absorbs any overlap, so it is processed like
                // live fills.
                for wire in payload.fills {
                    match wire.into_trade() {
                        Ok(trade) => {
                            let event = IngestEvent::Fill {
                                address: address.clone(),
                                trade,
                            };
                            if events_tx.send(event).await.is_err() {
                                return; // batcher gone, shutting down
                            }
                        }
                        Err(e) => {
                            warn!(address = %address, error = %e, "skipping malformed fill");
                        }
                    }
                }
            }
            debug!(address = %address, "fill reader stopped");
        });
    }

    // -------------------------------------------------------------------------
    // Pull path: clearinghouse snapshots
    // -------------------------------------------------------------------------

    /// Snapshot poll loop. Every interval, traders whose last snapshot is
    /// stale are dispatched in batches of ten, three seconds apart; requests
    /// within a batch run concurrently and each withdraws its weight from
    /// the rate budget before flight.
    pub async fn run_poll_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = sleep(POLL_BOOT_DELAY) => {}
            _ = shutdown.changed() => return,
        }
        info!(interval_s = self.poll_interval.as_secs(), "snapshot poll loop starting");

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let due = self.due_addresses();
            if due.is_empty() {
                continue;
            }
            debug!(count = due.len(), "snapshot poll round");

            let mut batches = due.chunks(POLL_BATCH).peekable();
            while let Some(batch) = batches.next() {
                let fetches = batch.iter().map(|address| self.poll_one(address.clone()));
                join_all(fetches).await;

                if batches.peek().is_some() {
                    tokio::select! {
                        _ = sleep(POLL_BATCH_GAP) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }
        info!("snapshot poll loop stopped");
    }

    /// Subscribed addresses whose last successful snapshot is older than the
    /// poll interval.
    fn due_addresses(&self) -> Vec<String> {
        let last = self.last_snapshot_at.lock();
        self.subscribed_addresses()
            .into_iter()
            .filter(|addr| match last.get(addr) {
                Some(at) => at.elapsed() >= self.poll_interval,
                None => true,
            })
            .collect()
    }

    async fn poll_one(&self, address: String) {
        match self.info.clearinghouse_state(&address).await {
            Ok(clearinghouse) => {
                self.last_snapshot_at
                    .lock()
                    .insert(address.clone(), Instant::now());
                let event = IngestEvent::Snapshot {
                    address,
                    clearinghouse,
                };
                let _ = self.events_tx.send(event).await;
            }
            Err(e) => {
                // Transient by policy: the next round covers this trader.
                warn!(address = %address, error = %e, "clearinghouse poll failed");
            }
        }
    }

    // -------------------------------------------------------------------------
    // Pull path: funding reconciliation
    // -------------------------------------------------------------------------

    /// Funding poll loop. Fills and positions arrive in near real time, but
    /// funding only exists as an HTTP history, so each round fetches
    /// payments past each trader's high-water mark.
    pub async fn run_funding_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        tokio::select! {
            _ = sleep(FUNDING_BOOT_DELAY) => {}
            _ = shutdown.changed() => return,
        }
        info!(
            interval_s = self.funding_poll_interval.as_secs(),
            "funding poll loop starting"
        );

        let mut ticker = interval(self.funding_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            for address in self.subscribed_addresses() {
                if *shutdown.borrow() {
                    return;
                }
                self.poll_funding(&address).await;
                sleep(FUNDING_ITEM_GAP).await;
            }
        }
        info!("funding poll loop stopped");
    }

    async fn poll_funding(&self, address: &str) {
        let now = Utc::now();
        let since: DateTime<Utc> = self
            .store
            .get(address)
            .and_then(|s| s.last_funding_time)
            .unwrap_or_else(|| now - chrono::Duration::from_std(self.funding_poll_interval)
                .unwrap_or_else(|_| chrono::Duration::hours(1)));

        // +1ms: the high-water payment itself is already applied.
        let start_ms = since.timestamp_millis() + 1;
        match self
            .info
            .user_funding(address, start_ms, now.timestamp_millis())
            .await
        {
            Ok(payments) if payments.is_empty() => {}
            Ok(payments) => {
                debug!(address, count = payments.len(), "funding payments fetched");
                let event = IngestEvent::Funding {
                    address: address.to_string(),
                    payments,
                };
                let _ = self.events_tx.send(event).await;
            }
            Err(e) => {
                warn!(address, error = %e, "funding poll failed");
            }
        }
    }
}

impl std::fmt::Debug for HybridStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridStream")
            .field("subscribed", &self.subscribed_count())
            .field("hybrid_mode", &self.use_hybrid_mode)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::rate_limit::RateBudget;

    fn addr(i: u32) -> String {
        format!("0x{i:040x}")
    }

    // The runner is returned (not spawned) so the command channel stays
    // open; admission only needs the registry, not a live socket.
    fn harness() -> (
        Arc<HybridStream>,
        mpsc::Receiver<IngestEvent>,
        crate::upstream::ws::WsRunner,
    ) {
        let budget = Arc::new(RateBudget::new());
        let (ws, runner) = WsClient::new("wss://example.invalid/ws", budget.clone());
        let info = InfoClient::new("https://example.invalid", budget);
        let store = Arc::new(TraderStateStore::new());
        let (tx, rx) = mpsc::channel(64);
        let hybrid = Arc::new(HybridStream::new(
            ws,
            info,
            store,
            tx,
            true,
            Duration::from_secs(300),
            Duration::from_secs(3600),
        ));
        (hybrid, rx, runner)
    }

    #[tokio::test]
    async fn first_ten_get_ws_fills_then_polling_only() {
        let (hybrid, _rx, _runner) = harness();

        for i in 0..USER_FILLS_CAP as u32 {
            let mode = hybrid.subscribe(&addr(i)).await.unwrap();
            assert_eq!(mode, FillDelivery::WsFills, "slot {i} should ride the socket");
        }
        let mode = hybrid.subscribe(&addr(99)).await.unwrap();
        assert_eq!(mode, FillDelivery::PollingOnly);
        assert_eq!(hybrid.subscribed_count(), USER_FILLS_CAP + 1);
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_and_normalizes() {
        let (hybrid, _rx, _runner) = harness();

        let mixed = "0x00000000000000000000000000000000000000AB";
        let first = hybrid.subscribe(mixed).await.unwrap();
        let second = hybrid.subscribe(&mixed.to_lowercase()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(hybrid.subscribed_count(), 1);
        assert!(hybrid.is_subscribed("0x00000000000000000000000000000000000000ab"));

        assert!(hybrid.subscribe("0xnot-an-address").await.is_err());
    }

    #[tokio::test]
    async fn unsubscribe_releases_everything() {
        let (hybrid, _rx, _runner) = harness();
        let a = addr(1);

        hybrid.store.initialize(1, &a);
        hybrid.subscribe(&a).await.unwrap();
        assert!(hybrid.is_subscribed(&a));

        hybrid.unsubscribe(&a).await;
        assert!(!hybrid.is_subscribed(&a));
        assert!(hybrid.store.get(&a).is_none());
        assert_eq!(hybrid.ws.user_fills_count(), 0);
    }

    #[tokio::test]
    async fn due_addresses_tracks_staleness() {
        let (hybrid, _rx, _runner) = harness();
        let a = addr(1);
        hybrid.subscribe(&a).await.unwrap();

        // Never polled: due immediately.
        assert_eq!(hybrid.due_addresses(), vec![a.clone()]);

        hybrid
            .last_snapshot_at
            .lock()
            .insert(a.clone(), Instant::now());
        assert!(hybrid.due_addresses().is_empty());
    }
}
