// =============================================================================
// Backfill worker — day-chunked historical fetch with chained state
// =============================================================================
//
// A job covers [start_time, end_time] for one trader and is processed as
// UTC-day-aligned chunks, strictly in order, with the state output of chunk
// N feeding chunk N+1. That chaining is the correctness property the whole
// worker is built around: the final state is identical to processing the
// union of all events in one pass.
//
// Jobs are durable rows claimed with SKIP LOCKED; several jobs run in
// parallel, with the worker count re-checked against the rate budget every
// ten seconds. Within one job, concurrency is exactly one chunk.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Days, Duration as ChronoDuration, NaiveTime, Utc};
use serde_json::json;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{interval, sleep, Duration, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::app_state::AppState;
use crate::pnl::calc;
use crate::store::db::{BackfillJob, Database};
use crate::types::{FundingPayment, Trade, TraderState};
use crate::upstream::{normalize_address, UpstreamError};

/// How often the worker pool re-checks the budget's recommendation.
const POOL_CHECK_INTERVAL: Duration = Duration::from_secs(10);

/// Rate smoothing between chunks within one job.
const INTER_CHUNK_SLEEP: Duration = Duration::from_secs(1);

/// Grace period before jobs stranded in 'active' are re-queued at boot.
const STALE_ACTIVE_GRACE_MINUTES: i64 = 10;

// -----------------------------------------------------------------------------
// Chunking
// -----------------------------------------------------------------------------

/// Slice `[start, end]` into UTC-day-aligned chunks: the first ends at the
/// next UTC midnight, the last at `end`.
pub fn day_chunks(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut chunks = Vec::new();
    let mut cursor = start;
    while cursor < end {
        let next_midnight = cursor
            .date_naive()
            .checked_add_days(Days::new(1))
            .map(|d| d.and_time(NaiveTime::MIN).and_utc())
            .unwrap_or(end);
        let chunk_end = next_midnight.min(end);
        chunks.push((cursor, chunk_end));
        cursor = chunk_end;
    }
    chunks
}

// -----------------------------------------------------------------------------
// Scheduler
// -----------------------------------------------------------------------------

/// Schedules jobs and answers status queries. The job id doubles as the
/// idempotency key: re-scheduling the same window is a no-op.
#[derive(Clone)]
pub struct BackfillScheduler {
    db: Database,
}

/// Job queue view for one address.
#[derive(Debug, serde::Serialize)]
pub struct BackfillStatus {
    pub active: Vec<BackfillJob>,
    pub waiting: Vec<BackfillJob>,
    /// Waiting jobs whose retry delay has not elapsed yet.
    pub delayed: Vec<BackfillJob>,
    pub completed: usize,
    pub failed: usize,
}

impl BackfillScheduler {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Enqueue a backfill covering the last `days` days. Returns the job id;
    /// `scheduled` is false when an identical job already existed.
    pub async fn schedule(
        &self,
        trader_id: i64,
        address: &str,
        days: u32,
    ) -> Result<(String, bool)> {
        let address = normalize_address(address)?;
        let end = Utc::now();
        let start = end - ChronoDuration::days(i64::from(days));
        let job_id = format!("backfill-{}-{}", address, start.timestamp_millis());

        let scheduled = self
            .db
            .enqueue_backfill_job(&job_id, trader_id, &address, start, end)
            .await?;
        if scheduled {
            info!(job_id = %job_id, days, "backfill scheduled");
        } else {
            debug!(job_id = %job_id, "backfill already queued");
        }
        Ok((job_id, scheduled))
    }

    pub async fn status(&self, address: &str) -> Result<BackfillStatus> {
        let jobs = self.db.jobs_for_address(address).await?;
        let now = Utc::now();

        let mut status = BackfillStatus {
            active: Vec::new(),
            waiting: Vec::new(),
            delayed: Vec::new(),
            completed: 0,
            failed: 0,
        };
        for job in jobs {
            match job.status.as_str() {
                "active" => status.active.push(job),
                "waiting" if job.next_run_at > now => status.delayed.push(job),
                "waiting" => status.waiting.push(job),
                "completed" => status.completed += 1,
                _ => status.failed += 1,
            }
        }
        Ok(status)
    }
}

// -----------------------------------------------------------------------------
// Worker pool
// -----------------------------------------------------------------------------

pub struct BackfillWorker {
    app: Arc<AppState>,
}

impl BackfillWorker {
    pub fn new(app: Arc<AppState>) -> Self {
        Self { app }
    }

    /// Claim-and-run loop. The pool grows to the budget's recommendation and
    /// shrinks by attrition as jobs finish.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        match self
            .app
            .db
            .requeue_stale_active_jobs(ChronoDuration::minutes(STALE_ACTIVE_GRACE_MINUTES))
            .await
        {
            Ok(0) => {}
            Ok(n) => warn!(requeued = n, "re-queued jobs stranded by previous run"),
            Err(e) => error!(error = %e, "stale job requeue failed"),
        }

        info!("backfill worker starting");
        let mut pool: JoinSet<()> = JoinSet::new();
        let mut ticker = interval(POOL_CHECK_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            while pool.try_join_next().is_some() {}

            let target = self.app.budget.recommended_workers();
            while pool.len() < target {
                match self.app.db.claim_backfill_job().await {
                    Ok(Some(job)) => {
                        debug!(job_id = %job.job_id, running = pool.len() + 1, "job claimed");
                        pool.spawn(run_job(self.app.clone(), job, shutdown.clone()));
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(error = %e, "job claim failed");
                        break;
                    }
                }
            }
        }

        // In-flight jobs notice the shutdown signal at their next chunk
        // boundary and release themselves.
        while pool.join_next().await.is_some() {}
        info!("backfill worker stopped");
    }
}

// -----------------------------------------------------------------------------
// Job execution
// -----------------------------------------------------------------------------

async fn run_job(app: Arc<AppState>, job: BackfillJob, shutdown: watch::Receiver<bool>) {
    info!(
        job_id = %job.job_id,
        start = %job.start_time,
        end = %job.end_time,
        attempt = job.attempts + 1,
        "backfill job starting"
    );

    match process_job(&app, &job, &shutdown).await {
        Ok(JobOutcome::Completed(state)) => {
            if let Err(e) = app.db.complete_job(&job.job_id).await {
                error!(job_id = %job.job_id, error = %e, "job completion mark failed");
            }
            fold_into_store(&app, &job.address, state);
            info!(job_id = %job.job_id, "backfill job completed");
        }
        Ok(JobOutcome::Released) => {
            if let Err(e) = app.db.release_job(&job.job_id).await {
                error!(job_id = %job.job_id, error = %e, "job release failed");
            }
            info!(job_id = %job.job_id, "backfill job released on shutdown");
        }
        Err(e) => {
            warn!(job_id = %job.job_id, error = %e, "backfill job failed");
            if let Err(mark) = app.db.fail_job(&job.job_id, &e.to_string()).await {
                error!(job_id = %job.job_id, error = %mark, "job failure mark failed");
            }
        }
    }
}

enum JobOutcome {
    Completed(TraderState),
    Released,
}

async fn process_job(
    app: &Arc<AppState>,
    job: &BackfillJob,
    shutdown: &watch::Receiver<bool>,
) -> Result<JobOutcome, UpstreamError> {
    let chunks = day_chunks(job.start_time, job.end_time);
    let total_chunks = chunks.len().max(1);

    let mut state = TraderState::new(job.trader_id, &job.address);
    let mut fills_total: u64 = 0;
    let mut funding_total: u64 = 0;
    let mut snapshots_written: u64 = 0;

    for (index, (chunk_start, chunk_end)) in chunks.into_iter().enumerate() {
        if *shutdown.borrow() {
            return Ok(JobOutcome::Released);
        }

        let start_ms = chunk_start.timestamp_millis();
        let end_ms = chunk_end.timestamp_millis();

        let (fills_res, funding_res) = tokio::join!(
            app.info.user_fills_window(&job.address, start_ms, end_ms),
            app.info.user_funding(&job.address, start_ms, end_ms),
        );

        // A transient fetch error degrades to an empty chunk: state is
        // unchanged, the job keeps moving, and the gap detector surfaces
        // the hole. A fatal (4xx) error fails the whole job — every later
        // chunk would be equally garbage.
        let fills = match fills_res {
            Ok(page) => {
                if page.capped {
                    warn!(job_id = %job.job_id, chunk = index, "fills window truncated at upstream cap");
                }
                page.fills
            }
            Err(e @ UpstreamError::Fatal { .. }) => return Err(e),
            Err(e) => {
                warn!(job_id = %job.job_id, chunk = index, error = %e, "fills fetch failed, empty chunk");
                Vec::new()
            }
        };
        let funding = match funding_res {
            Ok(payments) => payments,
            Err(e @ UpstreamError::Fatal { .. }) => return Err(e),
            Err(e) => {
                warn!(job_id = %job.job_id, chunk = index, error = %e, "funding fetch failed, empty chunk");
                Vec::new()
            }
        };

        fills_total += fills.len() as u64;
        funding_total += funding.len() as u64;

        apply_chunk(&mut state, &fills, &funding);

        // Idempotent on upstream identity; a failure here is transient
        // persistence trouble, retried implicitly by the next backfill.
        if let Err(e) = app.db.insert_trades(job.trader_id, &fills).await {
            warn!(job_id = %job.job_id, chunk = index, error = %e, "trade persistence failed");
        }
        if let Err(e) = app.db.insert_funding(job.trader_id, &funding).await {
            warn!(job_id = %job.job_id, chunk = index, error = %e, "funding persistence failed");
        }

        let snapshot = calc::create_snapshot(&state, None, chunk_end);
        match app.db.upsert_snapshots(&[snapshot]).await {
            Ok(_) => snapshots_written += 1,
            Err(e) => {
                warn!(job_id = %job.job_id, chunk = index, error = %e, "chunk snapshot upsert failed");
            }
        }

        let progress = json!({
            "percent": ((index + 1) * 100 / total_chunks) as u64,
            "fills": fills_total,
            "funding": funding_total,
            "snapshots": snapshots_written,
        });
        if let Err(e) = app.db.update_job_progress(&job.job_id, progress).await {
            debug!(job_id = %job.job_id, error = %e, "progress update failed");
        }

        sleep(INTER_CHUNK_SLEEP).await;
    }

    Ok(JobOutcome::Completed(state))
}

/// Apply one chunk's fills and funding in a single time-ordered pass over
/// the chained state.
fn apply_chunk(state: &mut TraderState, fills: &[Trade], funding: &[FundingPayment]) {
    enum Ev<'a> {
        Trade(&'a Trade),
        Funding(&'a FundingPayment),
    }

    let mut events: Vec<(DateTime<Utc>, Ev)> = fills
        .iter()
        .map(|t| (t.timestamp, Ev::Trade(t)))
        .chain(funding.iter().map(|p| (p.timestamp, Ev::Funding(p))))
        .collect();
    events.sort_by_key(|(ts, _)| *ts);

    for (_, event) in events {
        match event {
            Ev::Trade(trade) => {
                calc::apply_trade(state, trade);
                calc::update_position_from_fill(
                    state,
                    &trade.coin,
                    trade.side,
                    trade.size,
                    trade.price,
                );
            }
            Ev::Funding(payment) => calc::apply_funding(state, payment),
        }
    }
}

/// A completed job's final state replaces the live state only when it is at
/// least as fresh; concurrent live ingestion is never regressed.
fn fold_into_store(app: &Arc<AppState>, address: &str, state: TraderState) {
    match app.store.get(address) {
        Some(existing) if existing.last_updated > state.last_updated => {
            debug!(address, "live state newer than backfill result, keeping live");
        }
        _ => {
            app.store.set(address, state);
            debug!(address, "backfill state folded into store");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn chunks_align_to_utc_midnights() {
        let chunks = day_chunks(at(2024, 3, 1, 15, 30), at(2024, 3, 4, 6, 0));
        assert_eq!(
            chunks,
            vec![
                (at(2024, 3, 1, 15, 30), at(2024, 3, 2, 0, 0)),
                (at(2024, 3, 2, 0, 0), at(2024, 3, 3, 0, 0)),
                (at(2024, 3, 3, 0, 0), at(2024, 3, 4, 0, 0)),
                (at(2024, 3, 4, 0, 0), at(2024, 3, 4, 6, 0)),
            ]
        );
    }

    #[test]
    fn chunks_within_one_day_are_single() {
        let chunks = day_chunks(at(2024, 3, 1, 2, 0), at(2024, 3, 1, 20, 0));
        assert_eq!(chunks, vec![(at(2024, 3, 1, 2, 0), at(2024, 3, 1, 20, 0))]);
    }

    #[test]
    fn empty_or_inverted_ranges_produce_no_chunks() {
        assert!(day_chunks(at(2024, 3, 1, 0, 0), at(2024, 3, 1, 0, 0)).is_empty());
        assert!(day_chunks(at(2024, 3, 2, 0, 0), at(2024, 3, 1, 0, 0)).is_empty());
    }

    #[test]
    fn chunk_boundaries_are_contiguous() {
        let chunks = day_chunks(at(2024, 1, 1, 7, 45), at(2024, 1, 9, 12, 13));
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].1, pair[1].0, "chunks must tile the window");
        }
        assert_eq!(chunks.first().unwrap().0, at(2024, 1, 1, 7, 45));
        assert_eq!(chunks.last().unwrap().1, at(2024, 1, 9, 12, 13));
    }

    #[test]
    fn chunked_application_chains_state() {
        use crate::types::Side;
        use rust_decimal::Decimal;

        let mk = |seq: i64, pnl: i64| Trade {
            coin: "BTC".into(),
            side: Side::Sell,
            size: Decimal::ONE,
            price: Decimal::from(100),
            closed_pnl: Decimal::from(pnl),
            fee: Decimal::ZERO,
            timestamp: at(2024, 3, 1, 0, 0) + ChronoDuration::seconds(seq),
            tid: seq,
            is_liquidation: false,
            direction: None,
            start_position: None,
            tx_hash: None,
            oid: None,
        };

        // Chunk A: +100, chunk B: +200; chained total is 300 regardless of
        // which chunk's data arrived first.
        let mut state = TraderState::new(1, "0xabc");
        apply_chunk(&mut state, &[mk(1, 100)], &[]);
        apply_chunk(&mut state, &[mk(90_000, 200)], &[]);
        assert_eq!(state.realized_trading_pnl, Decimal::from(300));
        assert_eq!(state.trade_count, 2);
    }

    #[test]
    fn chunk_merges_fills_and_funding_by_time() {
        use crate::types::Side;
        use rust_decimal::Decimal;

        let t0 = at(2024, 3, 1, 0, 0);
        let fill = Trade {
            coin: "BTC".into(),
            side: Side::Buy,
            size: Decimal::ONE,
            price: Decimal::from(100),
            closed_pnl: Decimal::ZERO,
            fee: Decimal::ZERO,
            timestamp: t0 + ChronoDuration::seconds(30),
            tid: 1,
            is_liquidation: false,
            direction: None,
            start_position: None,
            tx_hash: None,
            oid: None,
        };
        let payment = FundingPayment {
            coin: "BTC".into(),
            funding_rate: Decimal::ZERO,
            payment: Decimal::from(-1),
            position_size_at_time: Decimal::ONE,
            timestamp: t0 + ChronoDuration::seconds(60),
        };

        let mut state = TraderState::new(1, "0xabc");
        apply_chunk(&mut state, &[fill], &[payment]);

        assert_eq!(state.realized_funding_pnl, Decimal::from(-1));
        // The funding event is the later of the two.
        assert_eq!(state.last_updated, t0 + ChronoDuration::seconds(60));
    }
}
