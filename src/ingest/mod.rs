// =============================================================================
// Ingestion — hybrid stream, market capture, discovery, backfill, batching
// =============================================================================

pub mod autosub;
pub mod backfill;
pub mod batcher;
pub mod capture;
pub mod gaps;
pub mod hybrid;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::types::{FundingPayment, Side, Trade};
use crate::upstream::messages::ClearinghouseState;

/// Everything that mutates trader state flows through one channel into the
/// snapshot batcher, which is the single consumer. Per-trader ordering is
/// therefore the batcher's observed arrival order.
#[derive(Debug)]
pub enum IngestEvent {
    /// Authoritative fill from the per-user WebSocket channel.
    Fill { address: String, trade: Trade },

    /// Raw participation in a coin-level market trade; the batcher
    /// synthesizes the fill against the state it holds at application time.
    MarketFill {
        address: String,
        coin: String,
        side: Side,
        price: Decimal,
        size: Decimal,
        timestamp: DateTime<Utc>,
        tid: i64,
        tx_hash: Option<String>,
    },

    /// Authoritative position/margin snapshot from the poll loop.
    Snapshot {
        address: String,
        clearinghouse: ClearinghouseState,
    },

    /// Funding payments discovered by the funding poll loop.
    Funding {
        address: String,
        payments: Vec<FundingPayment>,
    },
}

impl IngestEvent {
    pub fn address(&self) -> &str {
        match self {
            Self::Fill { address, .. }
            | Self::MarketFill { address, .. }
            | Self::Snapshot { address, .. }
            | Self::Funding { address, .. } => address,
        }
    }
}
