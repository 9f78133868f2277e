// =============================================================================
// Upstream wire types — /info responses and WebSocket frames
// =============================================================================
//
// The upstream serialises every numeric value as a JSON string ("40000.0").
// Wire structs therefore keep `String` fields and conversion into domain
// types happens exactly once, at the boundary, where a malformed value
// becomes an `UpstreamError::Schema` (record skipped, ingestion continues).
// =============================================================================

use std::collections::HashMap;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{FundingPayment, MarginType, Position, Side, Trade};
use crate::upstream::UpstreamError;

// -----------------------------------------------------------------------------
// Conversion helpers
// -----------------------------------------------------------------------------

/// Parse an upstream decimal string, attributing failures to `field`.
pub fn parse_decimal(raw: &str, field: &str) -> Result<Decimal, UpstreamError> {
    Decimal::from_str(raw)
        .map_err(|e| UpstreamError::Schema(format!("{field}='{raw}': {e}")))
}

fn parse_decimal_opt(raw: Option<&str>, field: &str) -> Result<Option<Decimal>, UpstreamError> {
    raw.map(|s| parse_decimal(s, field)).transpose()
}

/// Millisecond epoch timestamp to `DateTime<Utc>`.
pub fn ms_to_datetime(ms: i64) -> Result<DateTime<Utc>, UpstreamError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| UpstreamError::Schema(format!("timestamp out of range: {ms}")))
}

// -----------------------------------------------------------------------------
// Fills
// -----------------------------------------------------------------------------

/// One fill as returned by `userFillsByTime` / `userFills` and streamed on
/// the `userFills` WS channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFill {
    pub coin: String,
    /// "B" = buyer, "A" = seller.
    pub side: String,
    pub sz: String,
    pub px: String,
    pub closed_pnl: String,
    pub fee: String,
    /// Epoch milliseconds.
    pub time: i64,
    pub tid: i64,
    #[serde(default)]
    pub hash: Option<String>,
    #[serde(default)]
    pub oid: Option<i64>,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub start_position: Option<String>,
    /// Present (as an object) only on liquidation fills.
    #[serde(default)]
    pub liquidation: Option<serde_json::Value>,
}

impl WireFill {
    /// Convert into the domain trade record.
    pub fn into_trade(self) -> Result<Trade, UpstreamError> {
        let side = Side::from_str(&self.side).map_err(UpstreamError::Schema)?;
        Ok(Trade {
            coin: self.coin,
            side,
            size: parse_decimal(&self.sz, "sz")?,
            price: parse_decimal(&self.px, "px")?,
            closed_pnl: parse_decimal(&self.closed_pnl, "closedPnl")?,
            fee: parse_decimal(&self.fee, "fee")?,
            timestamp: ms_to_datetime(self.time)?,
            tid: self.tid,
            is_liquidation: self.liquidation.is_some(),
            direction: self.dir,
            start_position: parse_decimal_opt(self.start_position.as_deref(), "startPosition")?,
            tx_hash: self.hash,
            oid: self.oid,
        })
    }
}

/// Upstream cap on a single fills response. A response of exactly this
/// length is treated as truncated.
pub const FILLS_RESPONSE_CAP: usize = 2_000;

/// A page of fills plus whether the upstream cap was hit. Callers page
/// forward past `last_time` when `capped` is set.
#[derive(Debug, Clone)]
pub struct FillsPage {
    pub fills: Vec<Trade>,
    pub capped: bool,
}

// -----------------------------------------------------------------------------
// Clearinghouse state
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLeverage {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePosition {
    pub coin: String,
    /// Signed size.
    pub szi: String,
    #[serde(default)]
    pub entry_px: Option<String>,
    #[serde(default)]
    pub unrealized_pnl: Option<String>,
    #[serde(default)]
    pub leverage: Option<WireLeverage>,
    #[serde(default)]
    pub liquidation_px: Option<String>,
    #[serde(default)]
    pub margin_used: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireAssetPosition {
    pub position: WirePosition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireMarginSummary {
    pub account_value: String,
    #[serde(default)]
    pub total_ntl_pos: Option<String>,
    #[serde(default)]
    pub total_raw_usd: Option<String>,
}

/// Response to `{"type": "clearinghouseState", "user": ...}` — the
/// authoritative snapshot of one account's open positions and margin.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearinghouseState {
    #[serde(default)]
    pub asset_positions: Vec<WireAssetPosition>,
    pub margin_summary: WireMarginSummary,
    #[serde(default)]
    pub withdrawable: Option<String>,
}

impl ClearinghouseState {
    /// Account value as a decimal.
    pub fn account_value(&self) -> Result<Decimal, UpstreamError> {
        parse_decimal(&self.margin_summary.account_value, "accountValue")
    }

    /// Convert every non-zero asset position into a domain `Position`.
    /// Zero-size entries are dropped here so they never reach the store.
    pub fn positions(&self) -> Result<Vec<Position>, UpstreamError> {
        let mut out = Vec::with_capacity(self.asset_positions.len());
        for asset in &self.asset_positions {
            let wire = &asset.position;
            let size = parse_decimal(&wire.szi, "szi")?;
            if size.is_zero() {
                continue;
            }
            let margin_type = match wire.leverage.as_ref().map(|l| l.kind.as_str()) {
                Some("isolated") => MarginType::Isolated,
                _ => MarginType::Cross,
            };
            out.push(Position {
                coin: wire.coin.clone(),
                size,
                entry_price: parse_decimal_opt(wire.entry_px.as_deref(), "entryPx")?
                    .unwrap_or(Decimal::ZERO),
                leverage: wire
                    .leverage
                    .as_ref()
                    .map(|l| Decimal::from(l.value))
                    .unwrap_or(Decimal::ONE),
                liquidation_price: parse_decimal_opt(
                    wire.liquidation_px.as_deref(),
                    "liquidationPx",
                )?,
                margin_used: parse_decimal_opt(wire.margin_used.as_deref(), "marginUsed")?
                    .unwrap_or(Decimal::ZERO),
                margin_type,
                unrealized_pnl: parse_decimal_opt(wire.unrealized_pnl.as_deref(), "unrealizedPnl")?
                    .unwrap_or(Decimal::ZERO),
            });
        }
        Ok(out)
    }
}

// -----------------------------------------------------------------------------
// Funding
// -----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireFundingDelta {
    pub coin: String,
    /// Signed USD payment.
    pub usdc: String,
    pub funding_rate: String,
    /// Position size at funding time.
    pub szi: String,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
}

/// One entry of a `userFunding` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFundingEvent {
    pub time: i64,
    pub delta: WireFundingDelta,
}

impl WireFundingEvent {
    pub fn into_payment(self) -> Result<FundingPayment, UpstreamError> {
        Ok(FundingPayment {
            coin: self.delta.coin,
            funding_rate: parse_decimal(&self.delta.funding_rate, "fundingRate")?,
            payment: parse_decimal(&self.delta.usdc, "usdc")?,
            position_size_at_time: parse_decimal(&self.delta.szi, "szi")?,
            timestamp: ms_to_datetime(self.time)?,
        })
    }
}

// -----------------------------------------------------------------------------
// Portfolio
// -----------------------------------------------------------------------------

/// Periods the upstream summarises portfolios over.
pub const PORTFOLIO_PERIODS: [&str; 8] = [
    "day",
    "week",
    "month",
    "allTime",
    "perpDay",
    "perpWeek",
    "perpMonth",
    "perpAllTime",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WirePortfolioPeriod {
    #[serde(default)]
    pub account_value_history: Vec<(i64, String)>,
    #[serde(default)]
    pub pnl_history: Vec<(i64, String)>,
    #[serde(default)]
    pub vlm: Option<String>,
}

/// Response to `{"type": "portfolio", "user": ...}`: a list of
/// `[period, data]` pairs. Trusted as authoritative and surfaced with an
/// `upstream_portfolio` provenance tag, never recomputed.
pub type WirePortfolio = Vec<(String, WirePortfolioPeriod)>;

/// Find the trailing PnL value for a given period, if present.
pub fn portfolio_period_pnl(
    portfolio: &WirePortfolio,
    period: &str,
) -> Result<Option<Decimal>, UpstreamError> {
    for (name, data) in portfolio {
        if name == period {
            return match data.pnl_history.last() {
                Some((_, raw)) => parse_decimal(raw, "pnlHistory").map(Some),
                None => Ok(None),
            };
        }
    }
    Ok(None)
}

// -----------------------------------------------------------------------------
// Market trades
// -----------------------------------------------------------------------------

/// One coin-level trade from `recentTrades` or the `trades` WS channel.
/// `users` is `[buyer, seller]` in that order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMarketTrade {
    pub coin: String,
    pub side: String,
    pub px: String,
    pub sz: String,
    pub time: i64,
    #[serde(default)]
    pub hash: Option<String>,
    pub tid: i64,
    #[serde(default)]
    pub users: Vec<String>,
}

impl WireMarketTrade {
    // Order per upstream documentation; verified by integration probes
    // before each release because nothing in the payload labels the slots.
    pub fn buyer(&self) -> Option<&str> {
        self.users.first().map(String::as_str)
    }

    pub fn seller(&self) -> Option<&str> {
        self.users.get(1).map(String::as_str)
    }
}

// -----------------------------------------------------------------------------
// Mid prices
// -----------------------------------------------------------------------------

/// `allMids` response: coin → mid price.
pub type AllMids = HashMap<String, String>;

// -----------------------------------------------------------------------------
// WebSocket frames
// -----------------------------------------------------------------------------

/// Generic inbound WS envelope: every channel message carries `channel` and
/// a channel-specific `data` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WsFrame {
    pub channel: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Payload of a `userFills` channel message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WsUserFills {
    #[serde(default)]
    pub is_snapshot: Option<bool>,
    pub user: String,
    #[serde(default)]
    pub fills: Vec<WireFill>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fill_decodes_and_converts() {
        let raw = r#"{
            "coin": "BTC",
            "side": "B",
            "sz": "2.0",
            "px": "40000.0",
            "closedPnl": "0.0",
            "fee": "12.5",
            "time": 1700000000000,
            "tid": 42,
            "hash": "0xdead",
            "oid": 7,
            "dir": "Open Long",
            "startPosition": "0.0"
        }"#;
        let wire: WireFill = serde_json::from_str(raw).unwrap();
        let trade = wire.into_trade().unwrap();
        assert_eq!(trade.coin, "BTC");
        assert_eq!(trade.side, Side::Buy);
        assert_eq!(trade.size, Decimal::from(2));
        assert_eq!(trade.fee, Decimal::from_str("12.5").unwrap());
        assert_eq!(trade.tid, 42);
        assert!(!trade.is_liquidation);
        assert_eq!(trade.start_position, Some(Decimal::ZERO));
    }

    #[test]
    fn liquidation_marker_is_presence_based() {
        let raw = r#"{
            "coin": "ETH", "side": "A", "sz": "1", "px": "2000",
            "closedPnl": "-50", "fee": "1", "time": 1700000000000, "tid": 9,
            "liquidation": {"liquidatedUser": "0xabc", "markPx": "2000"}
        }"#;
        let wire: WireFill = serde_json::from_str(raw).unwrap();
        assert!(wire.into_trade().unwrap().is_liquidation);
    }

    #[test]
    fn bad_decimal_is_schema_error() {
        let raw = r#"{
            "coin": "BTC", "side": "B", "sz": "not-a-number", "px": "1",
            "closedPnl": "0", "fee": "0", "time": 1700000000000, "tid": 1
        }"#;
        let wire: WireFill = serde_json::from_str(raw).unwrap();
        match wire.into_trade() {
            Err(UpstreamError::Schema(msg)) => assert!(msg.contains("sz")),
            other => panic!("expected schema error, got {other:?}"),
        }
    }

    #[test]
    fn clearinghouse_drops_zero_positions() {
        let raw = r#"{
            "assetPositions": [
                {"position": {"coin": "BTC", "szi": "1.5", "entryPx": "40000",
                              "unrealizedPnl": "100",
                              "leverage": {"type": "cross", "value": 10},
                              "marginUsed": "6000"}},
                {"position": {"coin": "ETH", "szi": "0.0"}}
            ],
            "marginSummary": {"accountValue": "10500.5"},
            "withdrawable": "4000"
        }"#;
        let state: ClearinghouseState = serde_json::from_str(raw).unwrap();
        let positions = state.positions().unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].coin, "BTC");
        assert_eq!(positions[0].leverage, Decimal::from(10));
        assert_eq!(
            state.account_value().unwrap(),
            Decimal::from_str("10500.5").unwrap()
        );
    }

    #[test]
    fn funding_event_converts() {
        let raw = r#"{
            "time": 1700000000000,
            "delta": {"coin": "BTC", "usdc": "-1.25", "fundingRate": "0.0000125",
                      "szi": "2.0", "type": "funding"}
        }"#;
        let event: WireFundingEvent = serde_json::from_str(raw).unwrap();
        let payment = event.into_payment().unwrap();
        assert_eq!(payment.payment, Decimal::from_str("-1.25").unwrap());
        assert_eq!(payment.position_size_at_time, Decimal::from(2));
    }

    #[test]
    fn portfolio_period_lookup() {
        let raw = r#"[
            ["day", {"accountValueHistory": [[1700000000000, "1000"]],
                     "pnlHistory": [[1700000000000, "12.5"]], "vlm": "9000"}],
            ["perpMonth", {"pnlHistory": [[1700000000000, "-3"], [1700000060000, "250.75"]]}]
        ]"#;
        let portfolio: WirePortfolio = serde_json::from_str(raw).unwrap();
        assert_eq!(
            portfolio_period_pnl(&portfolio, "perpMonth").unwrap(),
            Some(Decimal::from_str("250.75").unwrap())
        );
        assert_eq!(portfolio_period_pnl(&portfolio, "week").unwrap(), None);

        // Every period name the response can carry is a known one.
        for (period, _) in &portfolio {
            assert!(PORTFOLIO_PERIODS.contains(&period.as_str()));
        }
    }

    #[test]
    fn market_trade_user_slots() {
        let raw = r#"{
            "coin": "SOL", "side": "B", "px": "150.5", "sz": "10",
            "time": 1700000000000, "tid": 77,
            "users": ["0xbuyer", "0xseller"]
        }"#;
        let trade: WireMarketTrade = serde_json::from_str(raw).unwrap();
        assert_eq!(trade.buyer(), Some("0xbuyer"));
        assert_eq!(trade.seller(), Some("0xseller"));
    }

    #[test]
    fn ws_user_fills_frame() {
        let raw = r#"{
            "channel": "userFills",
            "data": {
                "isSnapshot": true,
                "user": "0xabc",
                "fills": [{"coin": "BTC", "side": "A", "sz": "1", "px": "2",
                           "closedPnl": "0", "fee": "0", "time": 1700000000000,
                           "tid": 5}]
            }
        }"#;
        let frame: WsFrame = serde_json::from_str(raw).unwrap();
        assert_eq!(frame.channel, "userFills");
        let fills: WsUserFills = serde_json::from_value(frame.data).unwrap();
        assert_eq!(fills.is_snapshot, Some(true));
        assert_eq!(fills.fills.len(), 1);
    }
}
