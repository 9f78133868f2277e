// =============================================================================
// Auto-subscribe worker — drains the discovery queue into tracked traders
// =============================================================================
//
// Every minute, up to ten unprocessed queue entries are taken best-first
// (priority, then age) and walked one at a time with a half-second gap, so a
// burst of discoveries turns into a gentle trickle of new subscriptions and
// backfill jobs. A failing entry is logged and left unprocessed for the next
// run; it never halts the batch.
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{info, warn};

use crate::app_state::AppState;
use crate::types::{DiscoveryItem, DiscoveryResult};
use crate::upstream::normalize_address;

const RUN_INTERVAL: Duration = Duration::from_secs(60);
const ITEM_GAP: Duration = Duration::from_millis(500);
const BATCH_LIMIT: i64 = 10;

/// Historical window backfilled for a freshly discovered trader.
const DISCOVERY_BACKFILL_DAYS: u32 = 7;

pub struct AutoSubscribeWorker {
    app: Arc<AppState>,
}

impl AutoSubscribeWorker {
    pub fn new(app: Arc<AppState>) -> Self {
        Self { app }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!("auto-subscribe worker starting");
        let mut ticker = interval(RUN_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            if let Err(e) = self.process_batch(&shutdown).await {
                warn!(error = %e, "auto-subscribe batch failed");
            }
        }
        info!("auto-subscribe worker stopped");
    }

    async fn process_batch(&self, shutdown: &watch::Receiver<bool>) -> Result<()> {
        let items = self
            .app
            .db
            .pending_discoveries(BATCH_LIMIT)
            .await
            .context("discovery queue fetch failed")?;
        if items.is_empty() {
            return Ok(());
        }
        info!(count = items.len(), "processing discovery queue batch");

        for (index, item) in items.iter().enumerate() {
            if *shutdown.borrow() {
                break;
            }
            if index > 0 {
                sleep(ITEM_GAP).await;
            }
            // One bad entry never halts the run.
            if let Err(e) = self.process_item(item).await {
                warn!(address = %item.address, error = %e, "discovery item failed, will retry");
            }
        }
        Ok(())
    }

    /// Pending -> Processed(result), exactly once per entry.
    async fn process_item(&self, item: &DiscoveryItem) -> Result<()> {
        let address = match normalize_address(&item.address) {
            Ok(addr) => addr,
            Err(_) => {
                warn!(address = %item.address, "discovery entry has invalid address");
                self.mark(&item.address, DiscoveryResult::InvalidAddress)
                    .await?;
                return Ok(());
            }
        };

        if self.app.db.get_trader(&address).await?.is_some() {
            self.mark(&address, DiscoveryResult::AlreadySubscribed)
                .await?;
            return Ok(());
        }

        let trader = self
            .app
            .db
            .upsert_trader(&address, &item.source)
            .await
            .context("trader insert failed")?;

        self.app.store.initialize(trader.id, &address);
        self.app
            .hybrid
            .subscribe(&address)
            .await
            .context("hybrid subscription failed")?;
        self.app
            .backfill
            .schedule(trader.id, &address, DISCOVERY_BACKFILL_DAYS)
            .await
            .context("backfill scheduling failed")?;

        self.mark(&address, DiscoveryResult::Subscribed).await?;
        info!(address = %address, trader_id = trader.id, "discovered trader subscribed");
        Ok(())
    }

    async fn mark(&self, address: &str, result: DiscoveryResult) -> Result<()> {
        self.app
            .db
            .mark_discovery_processed(address, &result.to_string())
            .await
    }
}
