// =============================================================================
// Shared types used across the PnL indexer
// =============================================================================
//
// Every monetary and size field is a `rust_decimal::Decimal`. Arithmetic on
// these is exact; zero checks go through `Decimal::is_zero`, never equality
// against a float.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Side
// ---------------------------------------------------------------------------

/// Taker side of a fill as the upstream encodes it: `B` = buyer, `A` = seller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    #[serde(rename = "B")]
    Buy,
    #[serde(rename = "A")]
    Sell,
}

impl Side {
    /// Signed direction of the size delta this side applies to a position.
    pub fn sign(&self) -> Decimal {
        match self {
            Self::Buy => Decimal::ONE,
            Self::Sell => -Decimal::ONE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Buy => "B",
            Self::Sell => "A",
        }
    }
}

impl std::str::FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "B" => Ok(Self::Buy),
            "A" => Ok(Self::Sell),
            other => Err(format!("unknown side '{other}'")),
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Margin
// ---------------------------------------------------------------------------

/// Margin regime of a position. Orthogonal to PnL accounting; carried through
/// for the positions API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarginType {
    Cross,
    Isolated,
}

impl Default for MarginType {
    fn default() -> Self {
        Self::Cross
    }
}

impl std::fmt::Display for MarginType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cross => write!(f, "cross"),
            Self::Isolated => write!(f, "isolated"),
        }
    }
}

// ---------------------------------------------------------------------------
// Position
// ---------------------------------------------------------------------------

/// One open perpetual position. `size` is signed: positive = long, negative =
/// short. A zero-size position does not exist; the state store never holds
/// one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub coin: String,
    pub size: Decimal,
    pub entry_price: Decimal,
    #[serde(default)]
    pub leverage: Decimal,
    #[serde(default)]
    pub liquidation_price: Option<Decimal>,
    #[serde(default)]
    pub margin_used: Decimal,
    #[serde(default)]
    pub margin_type: MarginType,
    #[serde(default)]
    pub unrealized_pnl: Decimal,
}

impl Position {
    /// Minimal position as reconstructed from fills alone (no margin data).
    pub fn from_fill(coin: &str, size: Decimal, entry_price: Decimal) -> Self {
        Self {
            coin: coin.to_string(),
            size,
            entry_price,
            leverage: Decimal::ONE,
            liquidation_price: None,
            margin_used: Decimal::ZERO,
            margin_type: MarginType::Cross,
            unrealized_pnl: Decimal::ZERO,
        }
    }

    pub fn is_long(&self) -> bool {
        self.size > Decimal::ZERO
    }
}

// ---------------------------------------------------------------------------
// Trade (one upstream fill)
// ---------------------------------------------------------------------------

/// A single filled order attributed to one trader. `tid` is the upstream fill
/// id and the dedup key; `closed_pnl` is the realized PnL the upstream
/// attributes to this fill.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub coin: String,
    pub side: Side,
    /// Unsigned fill size.
    pub size: Decimal,
    pub price: Decimal,
    pub closed_pnl: Decimal,
    pub fee: Decimal,
    pub timestamp: DateTime<Utc>,
    pub tid: i64,
    #[serde(default)]
    pub is_liquidation: bool,
    #[serde(default)]
    pub direction: Option<String>,
    #[serde(default)]
    pub start_position: Option<Decimal>,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub oid: Option<i64>,
}

impl Trade {
    /// Notional value of the fill, `size * price`.
    pub fn notional(&self) -> Decimal {
        self.size * self.price
    }
}

// ---------------------------------------------------------------------------
// Funding
// ---------------------------------------------------------------------------

/// One periodic funding cashflow. `payment` is signed USD; realized funding
/// PnL for a trader is the sum of payments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FundingPayment {
    pub coin: String,
    pub funding_rate: Decimal,
    pub payment: Decimal,
    pub position_size_at_time: Decimal,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Per-trader running state
// ---------------------------------------------------------------------------

/// In-memory running PnL state for one trader. Mutated only through the pure
/// transition functions in `pnl::calc`; owned by the trader state store.
///
/// Invariants:
///   realized_pnl = realized_trading_pnl - total_fees + realized_funding_pnl
///   total_pnl    = realized_pnl + sum(position.unrealized_pnl)
///   positions never contains a zero-size entry
///   total_volume is monotonic non-decreasing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraderState {
    pub trader_id: i64,
    pub address: String,
    pub realized_trading_pnl: Decimal,
    pub realized_funding_pnl: Decimal,
    pub total_fees: Decimal,
    pub total_volume: Decimal,
    pub trade_count: u64,
    pub liquidation_count: u64,
    pub flip_count: u64,
    pub positions: HashMap<String, Position>,
    pub last_updated: DateTime<Utc>,
    /// High-water mark for the funding poll loop: timestamp of the newest
    /// funding payment already applied.
    #[serde(default)]
    pub last_funding_time: Option<DateTime<Utc>>,
}

impl TraderState {
    pub fn new(trader_id: i64, address: impl Into<String>) -> Self {
        Self {
            trader_id,
            address: address.into(),
            realized_trading_pnl: Decimal::ZERO,
            realized_funding_pnl: Decimal::ZERO,
            total_fees: Decimal::ZERO,
            total_volume: Decimal::ZERO,
            trade_count: 0,
            liquidation_count: 0,
            flip_count: 0,
            positions: HashMap::new(),
            last_updated: Utc::now(),
            last_funding_time: None,
        }
    }

    /// realized_trading_pnl - total_fees + realized_funding_pnl
    pub fn realized_pnl(&self) -> Decimal {
        self.realized_trading_pnl - self.total_fees + self.realized_funding_pnl
    }

    /// Sum of unrealized PnL over all open positions.
    pub fn unrealized_pnl(&self) -> Decimal {
        self.positions.values().map(|p| p.unrealized_pnl).sum()
    }

    pub fn total_pnl(&self) -> Decimal {
        self.realized_pnl() + self.unrealized_pnl()
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }
}

// ---------------------------------------------------------------------------
// Persisted snapshot row
// ---------------------------------------------------------------------------

/// One row of the `pnl_snapshots` table. Assembled by
/// `pnl::calc::create_snapshot`; written by the snapshot batcher and the
/// backfill worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PnlSnapshot {
    pub trader_id: i64,
    pub timestamp: DateTime<Utc>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub total_pnl: Decimal,
    pub funding_pnl: Decimal,
    pub trading_pnl: Decimal,
    pub open_positions: i32,
    pub total_volume: Decimal,
    pub account_value: Option<Decimal>,
}

// ---------------------------------------------------------------------------
// Trader row & discovery
// ---------------------------------------------------------------------------

/// One row of the `traders` table.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Trader {
    pub id: i64,
    pub address: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    pub is_active: bool,
    pub discovery_source: String,
}

/// Where an address entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoverySource {
    MarketTrade,
    Manual,
    ApiRequest,
}

impl std::fmt::Display for DiscoverySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MarketTrade => write!(f, "market_trade"),
            Self::Manual => write!(f, "manual"),
            Self::ApiRequest => write!(f, "api_request"),
        }
    }
}

/// A newly observed address waiting in the discovery queue.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DiscoveryItem {
    pub address: String,
    pub source: String,
    pub priority: i32,
    pub discovered_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

/// Outcome recorded when the auto-subscribe worker processes a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryResult {
    Subscribed,
    AlreadySubscribed,
    InvalidAddress,
}

impl std::fmt::Display for DiscoveryResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Subscribed => write!(f, "subscribed"),
            Self::AlreadySubscribed => write!(f, "already_subscribed"),
            Self::InvalidAddress => write!(f, "invalid_address"),
        }
    }
}

// ---------------------------------------------------------------------------
// Data gaps
// ---------------------------------------------------------------------------

/// Kind of coverage hole recorded in `data_gaps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapType {
    Snapshots,
    Fills,
    Funding,
}

impl std::fmt::Display for GapType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Snapshots => write!(f, "snapshots"),
            Self::Fills => write!(f, "fills"),
            Self::Funding => write!(f, "funding"),
        }
    }
}

/// One row of the `data_gaps` table.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DataGap {
    pub id: i64,
    pub trader_id: i64,
    pub gap_start: DateTime<Utc>,
    pub gap_end: DateTime<Utc>,
    pub gap_type: String,
    pub detected_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn side_roundtrip() {
        assert_eq!(Side::from_str("B").unwrap(), Side::Buy);
        assert_eq!(Side::from_str("A").unwrap(), Side::Sell);
        assert!(Side::from_str("X").is_err());
        assert_eq!(Side::Buy.sign(), Decimal::ONE);
        assert_eq!(Side::Sell.sign(), -Decimal::ONE);
    }

    #[test]
    fn side_serde_uses_upstream_encoding() {
        assert_eq!(serde_json::to_string(&Side::Buy).unwrap(), "\"B\"");
        assert_eq!(serde_json::to_string(&Side::Sell).unwrap(), "\"A\"");
        let s: Side = serde_json::from_str("\"A\"").unwrap();
        assert_eq!(s, Side::Sell);
    }

    #[test]
    fn realized_pnl_identity() {
        let mut state = TraderState::new(1, "0xabc");
        state.realized_trading_pnl = d("100");
        state.total_fees = d("7.5");
        state.realized_funding_pnl = d("-2.5");
        assert_eq!(state.realized_pnl(), d("90"));
        assert_eq!(state.total_pnl(), d("90"));

        state.positions.insert(
            "BTC".into(),
            Position {
                unrealized_pnl: d("10"),
                ..Position::from_fill("BTC", d("1"), d("40000"))
            },
        );
        assert_eq!(state.unrealized_pnl(), d("10"));
        assert_eq!(state.total_pnl(), d("100"));
    }

    #[test]
    fn trade_notional() {
        let trade = Trade {
            coin: "BTC".into(),
            side: Side::Buy,
            size: d("2"),
            price: d("40000"),
            closed_pnl: Decimal::ZERO,
            fee: Decimal::ZERO,
            timestamp: Utc::now(),
            tid: 1,
            is_liquidation: false,
            direction: None,
            start_position: None,
            tx_hash: None,
            oid: None,
        };
        assert_eq!(trade.notional(), d("80000"));
    }
}
