// =============================================================================
// Gap detector & data-status reporter
// =============================================================================
//
// A gap is a contiguous window longer than twice the snapshot interval with
// no snapshots for an active trader. The detector records new gaps, extends
// known ones, and resolves gaps that a later scan finds covered (a backfill
// filled the hole). Like every scan in this system it only ever records and
// reports; it never mutates ingested data.
//
// `data_status` is the provenance block attached to every PnL response:
// where the number came from, what coverage backs it, and a single derived
// confidence with a one-sentence rationale.
// =============================================================================

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::store::db::Database;
use crate::types::{DataGap, GapType, Trader};
use crate::upstream::messages::FILLS_RESPONSE_CAP;

/// Re-scan cadence after the startup scan.
const RESCAN_INTERVAL: Duration = Duration::from_secs(3_600);

/// Acceptance bound against the upstream portfolio: one part per thousand.
const PORTFOLIO_TOLERANCE_PERMILLE: i64 = 1;

// -----------------------------------------------------------------------------
// Hole finding (pure)
// -----------------------------------------------------------------------------

/// Contiguous sub-windows of `[range_start, range_end)` longer than
/// `threshold` containing none of `times` (which must be sorted ascending).
pub fn find_holes(
    range_start: DateTime<Utc>,
    range_end: DateTime<Utc>,
    times: &[DateTime<Utc>],
    threshold: ChronoDuration,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut holes = Vec::new();
    let mut prev = range_start;
    for &t in times {
        if t - prev > threshold {
            holes.push((prev, t));
        }
        prev = t;
    }
    if range_end - prev > threshold {
        holes.push((prev, range_end));
    }
    holes
}

fn overlaps(a: &(DateTime<Utc>, DateTime<Utc>), gap: &DataGap) -> bool {
    a.0 < gap.gap_end && a.1 > gap.gap_start
}

// -----------------------------------------------------------------------------
// Detector
// -----------------------------------------------------------------------------

pub struct GapDetector {
    db: Database,
    /// Twice the snapshot interval: the longest quiet period the poll loop
    /// can produce when healthy.
    threshold: ChronoDuration,
}

impl GapDetector {
    pub fn new(db: Database, snapshot_interval: std::time::Duration) -> Self {
        let threshold = ChronoDuration::from_std(snapshot_interval * 2)
            .unwrap_or_else(|_| ChronoDuration::minutes(10));
        Self { db, threshold }
    }

    /// Startup scan, then periodic re-scans until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(threshold_s = self.threshold.num_seconds(), "gap detector starting");
        if let Err(e) = self.scan_all().await {
            warn!(error = %e, "startup gap scan failed");
        }

        let mut ticker = interval(RESCAN_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // consume the immediate tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            if let Err(e) = self.scan_all().await {
                warn!(error = %e, "gap scan failed");
            }
        }
        info!("gap detector stopped");
    }

    pub async fn scan_all(&self) -> anyhow::Result<()> {
        let traders = self.db.active_traders().await?;
        let mut found = 0usize;
        let mut resolved = 0usize;
        for trader in &traders {
            match self.scan_trader(trader).await {
                Ok((f, r)) => {
                    found += f;
                    resolved += r;
                }
                Err(e) => warn!(address = %trader.address, error = %e, "trader gap scan failed"),
            }
        }
        info!(traders = traders.len(), found, resolved, "gap scan complete");
        Ok(())
    }

    /// Scan one trader: record new holes, resolve covered gaps.
    async fn scan_trader(&self, trader: &Trader) -> anyhow::Result<(usize, usize)> {
        let now = Utc::now();
        let times = self
            .db
            .snapshot_times(trader.id, trader.first_seen_at, now)
            .await?;
        let holes = find_holes(trader.first_seen_at, now, &times, self.threshold);

        for (start, end) in &holes {
            self.db
                .insert_gap(trader.id, *start, *end, GapType::Snapshots)
                .await?;
            debug!(address = %trader.address, start = %start, end = %end, "snapshot gap recorded");
        }

        let mut resolved = 0usize;
        for gap in self.db.open_gaps(trader.id).await? {
            // Trailing open-ended gaps keep growing until data appears, so
            // only gaps whose window no hole touches are considered covered.
            if !holes.iter().any(|h| overlaps(h, &gap)) {
                self.db.resolve_gap(gap.id).await?;
                resolved += 1;
                info!(address = %trader.address, gap_id = gap.id, "gap resolved");
            }
        }

        Ok((holes.len(), resolved))
    }
}

// -----------------------------------------------------------------------------
// Data status
// -----------------------------------------------------------------------------

/// Where a PnL figure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PnlSource {
    UpstreamPortfolio,
    OurCalculation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    Medium,
    Low,
    None,
}

/// Provenance block attached to every PnL response.
#[derive(Debug, Clone, Serialize)]
pub struct DataStatus {
    pub pnl_source: PnlSource,
    pub tracking_since: DateTime<Utc>,
    pub tracking_covers_timeframe: bool,
    pub fills_in_range: i64,
    pub fills_capped: bool,
    pub snapshots_in_range: i64,
    pub known_gaps: Vec<DataGap>,
    pub confidence: Confidence,
    pub confidence_reason: String,
}

/// Assemble the data-status block for one trader and window.
pub async fn data_status(
    db: &Database,
    trader: &Trader,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
    source: PnlSource,
) -> anyhow::Result<DataStatus> {
    let fills_in_range = db.count_fills_in_range(trader.id, from, to).await?;
    let snapshots_in_range = db.snapshot_times(trader.id, from, to).await?.len() as i64;
    let known_gaps = db.gaps_overlapping(trader.id, from, to).await?;

    let tracking_covers_timeframe = trader.first_seen_at <= from;
    let fills_capped = fills_in_range == FILLS_RESPONSE_CAP as i64;

    let (confidence, confidence_reason) = derive_confidence(
        snapshots_in_range,
        fills_capped,
        tracking_covers_timeframe,
        gap_fraction(&known_gaps, from, to),
        known_gaps.len(),
    );

    Ok(DataStatus {
        pnl_source: source,
        tracking_since: trader.first_seen_at,
        tracking_covers_timeframe,
        fills_in_range,
        fills_capped,
        snapshots_in_range,
        known_gaps,
        confidence,
        confidence_reason,
    })
}

/// Fraction of `[from, to)` covered by known gaps, clamped to the window.
fn gap_fraction(gaps: &[DataGap], from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let window = (to - from).num_seconds();
    if window <= 0 {
        return 0.0;
    }
    let covered: i64 = gaps
        .iter()
        .map(|g| {
            let start = g.gap_start.max(from);
            let end = g.gap_end.min(to);
            (end - start).num_seconds().max(0)
        })
        .sum();
    covered as f64 / window as f64
}

/// Single derived confidence with a one-sentence rationale. Ordered from
/// worst to best so the first failing check names the dominant cause.
pub fn derive_confidence(
    snapshots_in_range: i64,
    fills_capped: bool,
    tracking_covers_timeframe: bool,
    gap_fraction: f64,
    gap_count: usize,
) -> (Confidence, String) {
    if snapshots_in_range == 0 {
        return (
            Confidence::None,
            "No snapshots cover the requested window.".to_string(),
        );
    }
    if fills_capped {
        return (
            Confidence::Low,
            "Fill history hit the upstream response cap; realized PnL may be incomplete."
                .to_string(),
        );
    }
    if gap_fraction > 0.25 {
        return (
            Confidence::Low,
            format!(
                "Known gaps cover {:.0}% of the requested window.",
                gap_fraction * 100.0
            ),
        );
    }
    if !tracking_covers_timeframe {
        return (
            Confidence::Medium,
            "Tracking began after the start of the requested window.".to_string(),
        );
    }
    if gap_count > 0 {
        return (
            Confidence::Medium,
            "The window contains known snapshot gaps.".to_string(),
        );
    }
    (
        Confidence::High,
        "Continuous snapshot coverage for the full window.".to_string(),
    )
}

/// Relative discrepancy check against the upstream portfolio figure. Returns
/// the cause sentence when our number deviates by more than 1 ‰; a deviation
/// forces `confidence: low` in the response.
pub fn portfolio_discrepancy(ours: Decimal, upstream: Decimal) -> Option<String> {
    let scale = upstream.abs().max(Decimal::ONE);
    let tolerance = scale * Decimal::from(PORTFOLIO_TOLERANCE_PERMILLE) / Decimal::from(1_000);
    let diff = (ours - upstream).abs();
    if diff > tolerance {
        Some(format!(
            "Calculated PnL {ours} deviates from the upstream portfolio figure {upstream} by more than 1 permille."
        ))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::str::FromStr;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn holes_require_exceeding_threshold() {
        let threshold = ChronoDuration::minutes(10);
        let times = vec![at(0, 5), at(0, 14), at(0, 50)];
        // 0:14 -> 0:50 is 36 min: a hole. 0:50 -> 1:00 is only 10 min: not.
        let holes = find_holes(at(0, 0), at(1, 0), &times, threshold);
        assert_eq!(holes, vec![(at(0, 14), at(0, 50))]);
    }

    #[test]
    fn empty_series_is_one_big_hole() {
        let holes = find_holes(at(0, 0), at(2, 0), &[], ChronoDuration::minutes(10));
        assert_eq!(holes, vec![(at(0, 0), at(2, 0))]);
    }

    #[test]
    fn trailing_silence_is_an_open_ended_hole() {
        let holes = find_holes(
            at(0, 0),
            at(1, 0),
            &[at(0, 2), at(0, 8)],
            ChronoDuration::minutes(10),
        );
        assert_eq!(holes, vec![(at(0, 8), at(1, 0))]);
    }

    #[test]
    fn dense_series_has_no_holes() {
        let times: Vec<_> = (0..12).map(|i| at(0, i * 5)).collect();
        let holes = find_holes(at(0, 0), at(1, 0), &times, ChronoDuration::minutes(10));
        assert!(holes.is_empty());
    }

    #[test]
    fn confidence_ordering_names_dominant_cause() {
        let (c, _) = derive_confidence(0, true, false, 0.9, 3);
        assert_eq!(c, Confidence::None);

        let (c, reason) = derive_confidence(10, true, true, 0.0, 0);
        assert_eq!(c, Confidence::Low);
        assert!(reason.contains("cap"));

        let (c, reason) = derive_confidence(10, false, true, 0.4, 1);
        assert_eq!(c, Confidence::Low);
        assert!(reason.contains('%'));

        let (c, _) = derive_confidence(10, false, false, 0.0, 0);
        assert_eq!(c, Confidence::Medium);

        let (c, _) = derive_confidence(10, false, true, 0.1, 1);
        assert_eq!(c, Confidence::Medium);

        let (c, reason) = derive_confidence(10, false, true, 0.0, 0);
        assert_eq!(c, Confidence::High);
        assert!(reason.contains("Continuous"));
    }

    #[test]
    fn portfolio_tolerance_is_one_permille() {
        let d = |s: &str| Decimal::from_str(s).unwrap();
        assert!(portfolio_discrepancy(d("1000.5"), d("1000")).is_none());
        assert!(portfolio_discrepancy(d("1001.5"), d("1000")).is_some());
        // Near-zero upstream values use an absolute floor instead of a
        // vanishing relative band.
        assert!(portfolio_discrepancy(d("0.0005"), d("0")).is_none());
        assert!(portfolio_discrepancy(d("0.5"), d("0")).is_some());
    }

    #[test]
    fn gap_fraction_clamps_to_window() {
        let gap = DataGap {
            id: 1,
            trader_id: 1,
            gap_start: at(0, 0) - ChronoDuration::hours(5),
            gap_end: at(0, 30),
            gap_type: "snapshots".into(),
            detected_at: at(0, 0),
            resolved_at: None,
        };
        let f = gap_fraction(&[gap], at(0, 0), at(1, 0));
        assert!((f - 0.5).abs() < 1e-9);
    }
}
