// =============================================================================
// Trader state store — address → running PnL state, with tid deduplication
// =============================================================================
//
// Process-wide map shared by the ingestion paths and the read API. Each
// address owns its own lock, so two traders never contend and a reader
// always sees a consistent snapshot of one address at a time. The global
// count is an atomic that is eventually consistent with the map.
//
// Alongside each state sits a bounded FIFO window of processed fill ids:
// a WebSocket reconnect replays recent fills, and the window is what makes
// that replay harmless.
// =============================================================================

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::types::TraderState;

/// Processed-tid window capacity per trader; oldest evicted first.
pub const TID_WINDOW_CAPACITY: usize = 5_000;

// -----------------------------------------------------------------------------
// Tid window
// -----------------------------------------------------------------------------

struct TidWindow {
    seen: HashSet<i64>,
    order: VecDeque<i64>,
}

impl TidWindow {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record `tid`; true iff it was not already present.
    fn insert(&mut self, tid: i64) -> bool {
        if !self.seen.insert(tid) {
            return false;
        }
        self.order.push_back(tid);
        while self.order.len() > TID_WINDOW_CAPACITY {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }
}

// -----------------------------------------------------------------------------
// Store
// -----------------------------------------------------------------------------

struct Entry {
    state: TraderState,
    tids: TidWindow,
}

/// Shared store. Addresses must be normalized (lowercased) before use; the
/// store does not re-normalize.
pub struct TraderStateStore {
    entries: RwLock<HashMap<String, Arc<Mutex<Entry>>>>,
    count: AtomicUsize,
}

impl TraderStateStore {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            count: AtomicUsize::new(0),
        }
    }

    fn entry(&self, address: &str) -> Option<Arc<Mutex<Entry>>> {
        self.entries.read().get(address).cloned()
    }

    /// Snapshot of one trader's state, consistent under its address lock.
    pub fn get(&self, address: &str) -> Option<TraderState> {
        self.entry(address).map(|e| e.lock().state.clone())
    }

    /// Create zero state for `address` if none exists. Idempotent.
    pub fn initialize(&self, trader_id: i64, address: &str) {
        let mut entries = self.entries.write();
        if !entries.contains_key(address) {
            entries.insert(
                address.to_string(),
                Arc::new(Mutex::new(Entry {
                    state: TraderState::new(trader_id, address),
                    tids: TidWindow::new(),
                })),
            );
            self.count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Replace the state for `address`, creating the entry if needed. The
    /// tid window survives a replace: deduplication history is independent
    /// of state resets.
    pub fn set(&self, address: &str, state: TraderState) {
        if let Some(entry) = self.entry(address) {
            entry.lock().state = state;
            return;
        }
        let mut entries = self.entries.write();
        // Re-check under the write lock; another task may have raced us.
        match entries.get(address) {
            Some(entry) => entry.lock().state = state,
            None => {
                entries.insert(
                    address.to_string(),
                    Arc::new(Mutex::new(Entry {
                        state,
                        tids: TidWindow::new(),
                    })),
                );
                self.count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Record a processed fill id. Returns true iff the tid was absent, i.e.
    /// the fill should be applied. Unknown addresses return false: callers
    /// initialize state before marking.
    pub fn mark_tid(&self, address: &str, tid: i64) -> bool {
        match self.entry(address) {
            Some(entry) => entry.lock().tids.insert(tid),
            None => false,
        }
    }

    /// Run `f` on the state under its address lock. The closure must not
    /// block: per-address locks are held across it.
    pub fn with_state<R>(&self, address: &str, f: impl FnOnce(&mut TraderState) -> R) -> Option<R> {
        self.entry(address).map(|e| f(&mut e.lock().state))
    }

    /// Drop a trader's state and tid window.
    pub fn remove(&self, address: &str) {
        if self.entries.write().remove(address).is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn contains(&self, address: &str) -> bool {
        self.entries.read().contains_key(address)
    }

    /// Eventually-consistent count of tracked traders.
    pub fn tracked_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    /// Addresses currently tracked. Used by the poll loops; the list is a
    /// point-in-time copy, not a live view.
    pub fn addresses(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

impl Default for TraderStateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TraderStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraderStateStore")
            .field("tracked", &self.tracked_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    const ADDR: &str = "0x00000000000000000000000000000000000000aa";

    #[test]
    fn initialize_is_idempotent() {
        let store = TraderStateStore::new();
        store.initialize(1, ADDR);
        store.with_state(ADDR, |s| s.trade_count = 5).unwrap();
        store.initialize(1, ADDR);
        assert_eq!(store.get(ADDR).unwrap().trade_count, 5);
        assert_eq!(store.tracked_count(), 1);
    }

    #[test]
    fn mark_tid_dedups_and_requires_state() {
        let store = TraderStateStore::new();
        assert!(!store.mark_tid(ADDR, 42), "unknown address never applies");

        store.initialize(1, ADDR);
        assert!(store.mark_tid(ADDR, 42));
        assert!(!store.mark_tid(ADDR, 42), "replayed tid must be refused");
        assert!(store.mark_tid(ADDR, 43));
    }

    #[test]
    fn tid_window_evicts_oldest_first() {
        let store = TraderStateStore::new();
        store.initialize(1, ADDR);
        for tid in 0..(TID_WINDOW_CAPACITY as i64 + 1) {
            assert!(store.mark_tid(ADDR, tid));
        }
        // tid 0 was evicted, so it is accepted again; tid 1 is still held.
        assert!(store.mark_tid(ADDR, 0));
        assert!(!store.mark_tid(ADDR, 1));
    }

    #[test]
    fn set_preserves_tid_window() {
        let store = TraderStateStore::new();
        store.initialize(1, ADDR);
        assert!(store.mark_tid(ADDR, 7));

        let mut replacement = TraderState::new(1, ADDR);
        replacement.realized_trading_pnl = Decimal::from(100);
        store.set(ADDR, replacement);

        assert_eq!(
            store.get(ADDR).unwrap().realized_trading_pnl,
            Decimal::from(100)
        );
        assert!(!store.mark_tid(ADDR, 7), "reset must not forget dedup history");
    }

    #[test]
    fn remove_drops_everything() {
        let store = TraderStateStore::new();
        store.initialize(1, ADDR);
        store.mark_tid(ADDR, 1);
        store.remove(ADDR);

        assert!(store.get(ADDR).is_none());
        assert_eq!(store.tracked_count(), 0);
        assert!(!store.mark_tid(ADDR, 1));
    }

    #[test]
    fn replayed_fill_mutates_state_once() {
        use crate::pnl::calc;
        use crate::types::{Side, Trade};
        use chrono::Utc;

        let store = TraderStateStore::new();
        store.initialize(1, ADDR);

        let fill = Trade {
            coin: "BTC".into(),
            side: Side::Buy,
            size: Decimal::ONE,
            price: Decimal::from(100),
            closed_pnl: Decimal::from(10),
            fee: Decimal::ONE,
            timestamp: Utc::now(),
            tid: 42,
            is_liquidation: false,
            direction: None,
            start_position: None,
            tx_hash: None,
            oid: None,
        };

        // The consumer's sequence: guard on the tid, then apply.
        for _ in 0..2 {
            if store.mark_tid(ADDR, fill.tid) {
                store.with_state(ADDR, |s| calc::apply_trade(s, &fill));
            }
        }

        let state = store.get(ADDR).unwrap();
        assert_eq!(state.trade_count, 1);
        assert_eq!(state.realized_trading_pnl, Decimal::from(10));
        assert_eq!(state.total_fees, Decimal::ONE);
    }

    #[test]
    fn with_state_applies_under_lock() {
        let store = TraderStateStore::new();
        store.initialize(9, ADDR);
        let out = store.with_state(ADDR, |s| {
            s.trade_count += 1;
            s.trade_count
        });
        assert_eq!(out, Some(1));
        assert!(store.with_state("0xmissing", |_| ()).is_none());
    }
}
