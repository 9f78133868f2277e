// =============================================================================
// Summary statistics over a chronological PnL series
// =============================================================================

use rust_decimal::Decimal;
use serde::Serialize;

/// Aggregates derived from a chronological total-PnL series.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryStats {
    pub peak_pnl: Decimal,
    pub trough_pnl: Decimal,
    /// Largest peak-to-subsequent-trough decline: for each point, the
    /// distance below the running peak; the maximum of those distances.
    pub max_drawdown: Decimal,
}

impl Default for SummaryStats {
    fn default() -> Self {
        Self {
            peak_pnl: Decimal::ZERO,
            trough_pnl: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
        }
    }
}

/// Scan a chronological PnL series. An empty series yields all zeros.
pub fn calculate_summary_stats(history: &[Decimal]) -> SummaryStats {
    let Some(&first) = history.first() else {
        return SummaryStats::default();
    };

    let mut peak = first;
    let mut trough = first;
    let mut running_peak = first;
    let mut max_drawdown = Decimal::ZERO;

    for &value in &history[1..] {
        peak = peak.max(value);
        trough = trough.min(value);
        running_peak = running_peak.max(value);
        max_drawdown = max_drawdown.max(running_peak - value);
    }

    SummaryStats {
        peak_pnl: peak,
        trough_pnl: trough,
        max_drawdown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn series(values: &[&str]) -> Vec<Decimal> {
        values.iter().map(|v| Decimal::from_str(v).unwrap()).collect()
    }

    #[test]
    fn empty_series_is_all_zero() {
        assert_eq!(calculate_summary_stats(&[]), SummaryStats::default());
    }

    #[test]
    fn monotonic_rise_has_no_drawdown() {
        let stats = calculate_summary_stats(&series(&["0", "10", "20", "35"]));
        assert_eq!(stats.peak_pnl, Decimal::from(35));
        assert_eq!(stats.trough_pnl, Decimal::ZERO);
        assert_eq!(stats.max_drawdown, Decimal::ZERO);
    }

    #[test]
    fn drawdown_uses_running_peak_not_global_extrema() {
        // Global trough (-5) precedes the global peak (100): the naive
        // peak-minus-trough answer would be 105, but the realizable
        // drawdown is 100 -> 40 = 60.
        let stats = calculate_summary_stats(&series(&["-5", "100", "40", "90"]));
        assert_eq!(stats.peak_pnl, Decimal::from(100));
        assert_eq!(stats.trough_pnl, Decimal::from(-5));
        assert_eq!(stats.max_drawdown, Decimal::from(60));
    }

    #[test]
    fn drawdown_tracks_deepest_of_several_declines() {
        let stats = calculate_summary_stats(&series(&["0", "50", "30", "80", "10", "60"]));
        // 50 -> 30 is 20; 80 -> 10 is 70.
        assert_eq!(stats.max_drawdown, Decimal::from(70));
    }
}
