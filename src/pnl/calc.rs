// =============================================================================
// PnL state transitions
// =============================================================================
//
// Every function here is pure with respect to the outside world: it reads
// and writes only the state value handed to it, never the store, the
// database, or the clock. That is what makes backfill chunk chaining sound —
// applying the union of two event sets equals applying them chunk by chunk
// with the state threaded through.
//
// Timestamps on snapshots are always supplied by the caller: the hybrid path
// stamps emission time, the backfill path stamps the chunk end.
// =============================================================================

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};

use crate::types::{FundingPayment, PnlSnapshot, Position, Side, Trade, TraderState};

/// Fractional digits preserved by divisions (entry-price averaging).
/// Rounding is half-to-even.
pub const PRICE_SCALE: u32 = 12;

fn round_price(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(PRICE_SCALE, RoundingStrategy::MidpointNearestEven)
}

// -----------------------------------------------------------------------------
// Trade / funding application
// -----------------------------------------------------------------------------

/// Fold one fill into the running aggregates. Position bookkeeping is
/// separate (`update_position_from_fill`); authoritative fills carry their
/// own `closed_pnl` so this function never recomputes it.
pub fn apply_trade(state: &mut TraderState, trade: &Trade) {
    state.realized_trading_pnl += trade.closed_pnl;
    state.total_fees += trade.fee;
    state.total_volume += trade.notional();
    state.trade_count += 1;
    if trade.is_liquidation {
        state.liquidation_count += 1;
    }
    if is_position_flip(trade) {
        state.flip_count += 1;
    }
    state.last_updated = trade.timestamp;
}

/// A trade flips the position iff it starts from a non-zero position and
/// crosses through zero: the post-trade size is non-zero with the opposite
/// sign.
pub fn is_position_flip(trade: &Trade) -> bool {
    let Some(start) = trade.start_position else {
        return false;
    };
    if start.is_zero() {
        return false;
    }
    let end = start + trade.side.sign() * trade.size;
    if end.is_zero() {
        return false;
    }
    (start > Decimal::ZERO) != (end > Decimal::ZERO)
}

/// Fold one funding payment into the running aggregates.
pub fn apply_funding(state: &mut TraderState, funding: &FundingPayment) {
    state.realized_funding_pnl += funding.payment;
    state.last_updated = funding.timestamp;
    state.last_funding_time = Some(match state.last_funding_time {
        Some(prev) => prev.max(funding.timestamp),
        None => funding.timestamp,
    });
}

/// Replace the positions map from an authoritative clearinghouse snapshot.
/// Zero-size entries are dropped; the store never holds them.
pub fn update_positions(state: &mut TraderState, positions: Vec<Position>) {
    state.positions = positions
        .into_iter()
        .filter(|p| !p.size.is_zero())
        .map(|p| (p.coin.clone(), p))
        .collect();
}

// -----------------------------------------------------------------------------
// Market-trade fill synthesis
// -----------------------------------------------------------------------------

/// Derive a trade record from a coin-level market trade in which this trader
/// participated. The market channel exposes neither the trader's fee nor an
/// authoritative `closedPnl`, so the realized component is derived from the
/// tracked entry price and the fee is zero; the periodic reconciliation
/// restores truth.
#[allow(clippy::too_many_arguments)]
pub fn compute_fill_from_market_trade(
    state: &TraderState,
    coin: &str,
    price: Decimal,
    size: Decimal,
    our_side: Side,
    timestamp: DateTime<Utc>,
    tid: i64,
    tx_hash: Option<String>,
) -> Trade {
    let position = state.positions.get(coin);
    let start_position = position.map(|p| p.size).unwrap_or(Decimal::ZERO);

    let reduces = match position {
        Some(p) if !p.size.is_zero() => {
            (p.size > Decimal::ZERO && our_side == Side::Sell)
                || (p.size < Decimal::ZERO && our_side == Side::Buy)
        }
        _ => false,
    };

    let closed_pnl = if reduces {
        let p = position.expect("reduces implies a position");
        let close_size = size.min(p.size.abs());
        let direction_sign = if p.size > Decimal::ZERO {
            Decimal::ONE
        } else {
            -Decimal::ONE
        };
        (price - p.entry_price) * close_size * direction_sign
    } else {
        Decimal::ZERO
    };

    let direction = direction_label(start_position, our_side, size);

    Trade {
        coin: coin.to_string(),
        side: our_side,
        size,
        price,
        closed_pnl,
        fee: Decimal::ZERO,
        timestamp,
        tid,
        is_liquidation: false,
        direction: Some(direction),
        start_position: Some(start_position),
        tx_hash,
        oid: None,
    }
}

/// Human label matching the upstream's `dir` vocabulary.
fn direction_label(start: Decimal, side: Side, size: Decimal) -> String {
    let end = start + side.sign() * size;
    let label = match (
        start.is_zero(),
        end.is_zero(),
        start > Decimal::ZERO,
        end > Decimal::ZERO,
    ) {
        (true, _, _, true) => "Open Long",
        (true, _, _, false) => "Open Short",
        (false, true, true, _) => "Close Long",
        (false, true, false, _) => "Close Short",
        (false, false, true, true) if end > start => "Open Long",
        (false, false, true, true) => "Close Long",
        (false, false, false, false) if end < start => "Open Short",
        (false, false, false, false) => "Close Short",
        (false, false, true, false) => "Long > Short",
        (false, false, false, true) => "Short > Long",
    };
    label.to_string()
}

// -----------------------------------------------------------------------------
// Position bookkeeping from a fill
// -----------------------------------------------------------------------------

/// Apply one fill's size delta to the tracked position for `coin`.
///
/// - lands on zero: the position is deleted
/// - opens or flips: entry price is the fill price
/// - adds (same sign): entry price becomes the size-weighted average
/// - partial reduce: entry price unchanged
pub fn update_position_from_fill(
    state: &mut TraderState,
    coin: &str,
    side: Side,
    size: Decimal,
    price: Decimal,
) {
    let delta = side.sign() * size;
    let old = state.positions.get(coin);
    let old_size = old.map(|p| p.size).unwrap_or(Decimal::ZERO);
    let old_entry = old.map(|p| p.entry_price).unwrap_or(Decimal::ZERO);
    let new_size = old_size + delta;

    if new_size.is_zero() {
        state.positions.remove(coin);
        return;
    }

    let opened_or_flipped =
        old_size.is_zero() || (old_size > Decimal::ZERO) != (new_size > Decimal::ZERO);

    let entry_price = if opened_or_flipped {
        price
    } else if new_size.abs() > old_size.abs() {
        // Adding to an existing same-sign position.
        round_price(
            (old_entry * old_size.abs() + price * size) / (old_size.abs() + size),
        )
    } else {
        old_entry
    };

    match state.positions.get_mut(coin) {
        Some(p) => {
            p.size = new_size;
            p.entry_price = entry_price;
        }
        None => {
            state
                .positions
                .insert(coin.to_string(), Position::from_fill(coin, new_size, entry_price));
        }
    }
}

// -----------------------------------------------------------------------------
// Snapshot assembly
// -----------------------------------------------------------------------------

/// Assemble a snapshot row from the state's derived quantities.
pub fn create_snapshot(
    state: &TraderState,
    account_value: Option<Decimal>,
    timestamp: DateTime<Utc>,
) -> PnlSnapshot {
    PnlSnapshot {
        trader_id: state.trader_id,
        timestamp,
        realized_pnl: state.realized_pnl(),
        unrealized_pnl: state.unrealized_pnl(),
        total_pnl: state.total_pnl(),
        funding_pnl: state.realized_funding_pnl,
        trading_pnl: state.realized_trading_pnl,
        open_positions: state.open_position_count() as i32,
        total_volume: state.total_volume,
        account_value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn d(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn ts(seq: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(1_700_000_000_000 + seq * 1_000).single().unwrap()
    }

    fn trade(seq: i64, side: Side, size: &str, price: &str, closed_pnl: &str, fee: &str) -> Trade {
        Trade {
            coin: "BTC".into(),
            side,
            size: d(size),
            price: d(price),
            closed_pnl: d(closed_pnl),
            fee: d(fee),
            timestamp: ts(seq),
            tid: seq,
            is_liquidation: false,
            direction: None,
            start_position: None,
            tx_hash: None,
            oid: None,
        }
    }

    /// Feed one market trade through synthesis + aggregates + position
    /// bookkeeping, the way the capture path does.
    fn market_fill(state: &mut TraderState, seq: i64, side: Side, size: &str, price: &str) -> Trade {
        let fill = compute_fill_from_market_trade(
            state,
            "BTC",
            d(price),
            d(size),
            side,
            ts(seq),
            seq,
            None,
        );
        apply_trade(state, &fill);
        update_position_from_fill(state, "BTC", side, d(size), d(price));
        fill
    }

    // ── Scenario 1: open then close ─────────────────────────────────────

    #[test]
    fn open_then_close_accumulates_realized_pnl_and_volume() {
        let mut state = TraderState::new(1, "0xabc");
        let t1 = trade(1, Side::Buy, "2", "40000", "0", "0");
        let t2 = trade(2, Side::Sell, "2", "45000", "10000", "0");

        apply_trade(&mut state, &t1);
        update_position_from_fill(&mut state, "BTC", Side::Buy, d("2"), d("40000"));
        apply_trade(&mut state, &t2);
        update_position_from_fill(&mut state, "BTC", Side::Sell, d("2"), d("45000"));

        assert_eq!(state.realized_trading_pnl, d("10000"));
        assert_eq!(state.total_volume, d("170000"));
        assert!(state.positions.is_empty());
        assert_eq!(state.trade_count, 2);
    }

    // ── Scenario 2: oversell splits into close + flip ───────────────────

    #[test]
    fn oversell_closes_at_entry_then_flips_short() {
        let mut state = TraderState::new(1, "0xabc");
        state
            .positions
            .insert("BTC".into(), Position::from_fill("BTC", d("2"), d("50000")));

        let fill = compute_fill_from_market_trade(
            &state,
            "BTC",
            d("55000"),
            d("5"),
            Side::Sell,
            ts(1),
            1,
            None,
        );
        // Only the closable part realizes PnL: (55000-50000) * min(5,2) * +1.
        assert_eq!(fill.closed_pnl, d("10000"));
        assert_eq!(fill.fee, Decimal::ZERO);
        assert_eq!(fill.start_position, Some(d("2")));
        assert_eq!(fill.direction.as_deref(), Some("Long > Short"));

        update_position_from_fill(&mut state, "BTC", Side::Sell, d("5"), d("55000"));
        let pos = &state.positions["BTC"];
        assert_eq!(pos.size, d("-3"));
        assert_eq!(pos.entry_price, d("55000"));
    }

    // ── Scenario 3: size-weighted entry averaging ───────────────────────

    #[test]
    fn adding_to_position_averages_entry_price() {
        let mut state = TraderState::new(1, "0xabc");
        update_position_from_fill(&mut state, "BTC", Side::Buy, d("1"), d("40000"));
        update_position_from_fill(&mut state, "BTC", Side::Buy, d("1"), d("50000"));

        let pos = &state.positions["BTC"];
        assert_eq!(pos.size, d("2"));
        assert_eq!(pos.entry_price, d("45000"));
    }

    #[test]
    fn entry_average_rounds_half_even_at_twelve_digits() {
        let mut state = TraderState::new(1, "0xabc");
        update_position_from_fill(&mut state, "BTC", Side::Buy, d("1"), d("1"));
        update_position_from_fill(&mut state, "BTC", Side::Buy, d("2"), d("2"));
        // (1*1 + 2*2) / 3 = 5/3 = 1.666... rounded at 12 fractional digits.
        let pos = &state.positions["BTC"];
        assert_eq!(pos.entry_price, d("1.666666666667"));
    }

    #[test]
    fn partial_reduce_keeps_entry_price() {
        let mut state = TraderState::new(1, "0xabc");
        update_position_from_fill(&mut state, "BTC", Side::Sell, d("4"), d("60000"));
        update_position_from_fill(&mut state, "BTC", Side::Buy, d("1"), d("59000"));

        let pos = &state.positions["BTC"];
        assert_eq!(pos.size, d("-3"));
        assert_eq!(pos.entry_price, d("60000"));
    }

    // ── Scenario 4: scalper sequence ────────────────────────────────────

    #[test]
    fn scalper_sequence_nets_260_over_twelve_trades() {
        let mut state = TraderState::new(1, "0xabc");

        market_fill(&mut state, 1, Side::Buy, "1", "60000");
        market_fill(&mut state, 2, Side::Sell, "1", "60050"); // +50
        market_fill(&mut state, 3, Side::Buy, "2", "60020");
        market_fill(&mut state, 4, Side::Sell, "1", "60010"); // -10
        market_fill(&mut state, 5, Side::Sell, "1", "60150"); // +130
        market_fill(&mut state, 6, Side::Sell, "2", "59900"); // open short
        market_fill(&mut state, 7, Side::Buy, "1", "59850"); // +50
        market_fill(&mut state, 8, Side::Buy, "1", "59950"); // -50
        market_fill(&mut state, 9, Side::Buy, "3", "59800");
        market_fill(&mut state, 10, Side::Sell, "5", "59830"); // +90, flip short 2
        market_fill(&mut state, 11, Side::Sell, "2", "59790");
        market_fill(&mut state, 12, Side::Sell, "1", "59760");

        assert_eq!(state.realized_trading_pnl, d("260"));
        assert_eq!(state.trade_count, 12);
        assert_eq!(state.flip_count, 1);

        let pos = &state.positions["BTC"];
        assert_eq!(pos.size, d("-5"));
        assert_eq!(pos.entry_price, d("59800"));
    }

    // ── Flip detection ──────────────────────────────────────────────────

    #[test]
    fn flip_requires_crossing_zero() {
        let mut t = trade(1, Side::Sell, "5", "100", "0", "0");
        t.start_position = Some(d("2"));
        assert!(is_position_flip(&t)); // 2 -> -3

        t.start_position = Some(d("5"));
        assert!(!is_position_flip(&t)); // 5 -> 0, lands exactly flat

        t.start_position = Some(d("7"));
        assert!(!is_position_flip(&t)); // partial reduce

        t.start_position = Some(Decimal::ZERO);
        assert!(!is_position_flip(&t)); // opening is not a flip

        t.start_position = None;
        assert!(!is_position_flip(&t));
    }

    // ── Funding ─────────────────────────────────────────────────────────

    #[test]
    fn funding_accumulates_and_tracks_high_water_mark() {
        let mut state = TraderState::new(1, "0xabc");
        let pay = |seq: i64, usd: &str| FundingPayment {
            coin: "BTC".into(),
            funding_rate: d("0.0000125"),
            payment: d(usd),
            position_size_at_time: d("2"),
            timestamp: ts(seq),
        };

        apply_funding(&mut state, &pay(2, "-1.5"));
        apply_funding(&mut state, &pay(1, "0.5")); // out-of-order replay
        assert_eq!(state.realized_funding_pnl, d("-1"));
        assert_eq!(state.last_funding_time, Some(ts(2)));
    }

    // ── Invariants ──────────────────────────────────────────────────────

    #[test]
    fn realized_identity_holds_at_every_step() {
        let mut state = TraderState::new(1, "0xabc");
        let events = [
            trade(1, Side::Buy, "1", "100", "0", "0.3"),
            trade(2, Side::Sell, "1", "110", "10", "0.2"),
            trade(3, Side::Sell, "2", "105", "0", "0.6"),
            trade(4, Side::Buy, "2", "95", "20", "0.4"),
        ];
        let mut last_volume = Decimal::ZERO;
        for (i, t) in events.iter().enumerate() {
            apply_trade(&mut state, t);
            if i % 2 == 0 {
                apply_funding(
                    &mut state,
                    &FundingPayment {
                        coin: "BTC".into(),
                        funding_rate: d("0.0001"),
                        payment: d("-0.25"),
                        position_size_at_time: d("1"),
                        timestamp: ts(i as i64 + 100),
                    },
                );
            }
            assert_eq!(
                state.realized_pnl(),
                state.realized_trading_pnl - state.total_fees + state.realized_funding_pnl
            );
            assert!(state.total_volume >= last_volume, "volume must not regress");
            last_volume = state.total_volume;
        }
        assert_eq!(state.realized_trading_pnl, d("30"));
        assert_eq!(state.total_fees, d("1.5"));
        assert_eq!(state.realized_funding_pnl, d("-0.5"));
    }

    #[test]
    fn position_updates_never_store_zero_size() {
        let mut state = TraderState::new(1, "0xabc");
        let steps: [(Side, &str, &str); 6] = [
            (Side::Buy, "1", "100"),
            (Side::Buy, "2", "110"),
            (Side::Sell, "3", "120"), // back to flat
            (Side::Sell, "4", "115"),
            (Side::Buy, "4", "110"), // flat again
            (Side::Buy, "0.5", "100"),
        ];
        for (side, size, price) in steps {
            update_position_from_fill(&mut state, "BTC", side, d(size), d(price));
            assert!(state.positions.values().all(|p| !p.size.is_zero()));
        }
        assert_eq!(state.positions["BTC"].size, d("0.5"));
    }

    #[test]
    fn chunked_application_equals_single_pass() {
        // Associativity of the transitions: the same events applied in two
        // chunks with the state threaded through match one combined pass.
        let events: Vec<Trade> = vec![
            trade(1, Side::Buy, "1", "100", "0", "0.1"),
            trade(2, Side::Buy, "1", "102", "0", "0.1"),
            trade(3, Side::Sell, "2", "105", "8", "0.2"),
            trade(4, Side::Sell, "1", "103", "0", "0.1"),
            trade(5, Side::Buy, "1", "101", "2", "0.1"),
        ];

        let mut chunked = TraderState::new(1, "0xabc");
        for t in &events[..2] {
            apply_trade(&mut chunked, t);
            update_position_from_fill(&mut chunked, "BTC", t.side, t.size, t.price);
        }
        for t in &events[2..] {
            apply_trade(&mut chunked, t);
            update_position_from_fill(&mut chunked, "BTC", t.side, t.size, t.price);
        }

        let mut single = TraderState::new(1, "0xabc");
        for t in &events {
            apply_trade(&mut single, t);
            update_position_from_fill(&mut single, "BTC", t.side, t.size, t.price);
        }

        assert_eq!(chunked, single);
    }

    // ── Snapshot assembly ───────────────────────────────────────────────

    #[test]
    fn snapshot_reflects_derived_quantities() {
        let mut state = TraderState::new(7, "0xabc");
        state.realized_trading_pnl = d("100");
        state.total_fees = d("10");
        state.realized_funding_pnl = d("5");
        state.total_volume = d("5000");
        state.trade_count = 3;
        state.positions.insert(
            "BTC".into(),
            Position {
                unrealized_pnl: d("42"),
                ..Position::from_fill("BTC", d("1"), d("40000"))
            },
        );

        let when = ts(9);
        let snap = create_snapshot(&state, Some(d("1042")), when);
        assert_eq!(snap.trader_id, 7);
        assert_eq!(snap.timestamp, when);
        assert_eq!(snap.trading_pnl, d("100"));
        assert_eq!(snap.funding_pnl, d("5"));
        assert_eq!(snap.realized_pnl, d("95"));
        assert_eq!(snap.unrealized_pnl, d("42"));
        assert_eq!(snap.total_pnl, d("137"));
        assert_eq!(snap.open_positions, 1);
        assert_eq!(snap.account_value, Some(d("1042")));
    }

    #[test]
    fn market_fill_without_position_realizes_nothing() {
        let state = TraderState::new(1, "0xabc");
        let fill = compute_fill_from_market_trade(
            &state,
            "BTC",
            d("100"),
            d("1"),
            Side::Buy,
            ts(1),
            1,
            None,
        );
        assert_eq!(fill.closed_pnl, Decimal::ZERO);
        assert_eq!(fill.direction.as_deref(), Some("Open Long"));
        assert_eq!(fill.start_position, Some(Decimal::ZERO));
    }

    #[test]
    fn market_fill_same_direction_adds_without_realizing() {
        let mut state = TraderState::new(1, "0xabc");
        state
            .positions
            .insert("BTC".into(), Position::from_fill("BTC", d("1"), d("100")));
        let fill = compute_fill_from_market_trade(
            &state,
            "BTC",
            d("120"),
            d("1"),
            Side::Buy,
            ts(1),
            1,
            None,
        );
        assert_eq!(fill.closed_pnl, Decimal::ZERO);
        assert_eq!(fill.direction.as_deref(), Some("Open Long"));
    }
}
