// =============================================================================
// Database repository — all SQL lives here
// =============================================================================
//
// Write discipline (mirrors the schema's intent): trade and funding rows are
// insert-only and idempotent on their upstream identity; snapshots are
// upserted on (trader_id, timestamp); only discovery-queue processing and
// backfill-job claiming mutate rows in place.
//
// The pool is bounded; writers serialize on it. Per-query time is bounded by
// the pool's acquire timeout plus the statement itself — callers treat any
// failure as PersistenceTransient unless it is a constraint violation.
// =============================================================================

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::QueryBuilder;
use tracing::{debug, info};

use crate::types::{
    DataGap, DiscoveryItem, DiscoverySource, FundingPayment, GapType, PnlSnapshot, Trade, Trader,
};

/// Pool acquire budget; queries blocked longer than this fail as transient.
const ACQUIRE_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// Rows per multi-row INSERT. Postgres caps bind parameters at 65 535; the
/// widest insert here uses 14 per row, so 1 000 leaves ample headroom.
const INSERT_CHUNK: usize = 1_000;

/// Backfill retry schedule: base delay, doubled per attempt.
pub const JOB_RETRY_BASE_SECS: i64 = 5;
pub const JOB_MAX_ATTEMPTS: i32 = 3;

// -----------------------------------------------------------------------------
// Backfill job row
// -----------------------------------------------------------------------------

/// One row of `backfill_jobs`. Status machine:
/// waiting -> active -> {completed | failed}, with failed attempts bounced
/// back to waiting until the retry budget runs out.
#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct BackfillJob {
    pub job_id: String,
    pub trader_id: i64,
    pub address: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: String,
    pub attempts: i32,
    pub next_run_at: DateTime<Utc>,
    pub progress: serde_json::Value,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregates used to rebuild running state at boot.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TradeAggregates {
    pub trading_pnl: Option<Decimal>,
    pub total_fees: Option<Decimal>,
    pub total_volume: Option<Decimal>,
    pub trade_count: i64,
    pub liquidation_count: i64,
    pub flip_count: i64,
    pub last_trade_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct FundingAggregates {
    pub funding_pnl: Option<Decimal>,
    pub last_funding_at: Option<DateTime<Utc>>,
}

// -----------------------------------------------------------------------------
// Database
// -----------------------------------------------------------------------------

/// Handle over the bounded connection pool. Cheap to clone.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect and run migrations. Failures here are fatal boot errors.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(database_url)
            .await
            .context("failed to connect to database")?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("database migration failed")?;

        info!(max_connections, "database connected, migrations applied");
        Ok(Self { pool })
    }

    // =========================================================================
    // Traders
    // =========================================================================

    /// Insert the trader if unseen, bump `last_updated_at` otherwise.
    /// `address` must already be normalized; `source` is a
    /// [`DiscoverySource`] label or a queue-row passthrough.
    pub async fn upsert_trader(&self, address: &str, source: &str) -> Result<Trader> {
        sqlx::query_as::<_, Trader>(
            r#"
            INSERT INTO traders (address, discovery_source)
            VALUES ($1, $2)
            ON CONFLICT (address)
            DO UPDATE SET last_updated_at = now()
            RETURNING id, address, first_seen_at, last_updated_at, is_active, discovery_source
            "#,
        )
        .bind(address)
        .bind(source)
        .fetch_one(&self.pool)
        .await
        .context("upsert_trader failed")
    }

    pub async fn get_trader(&self, address: &str) -> Result<Option<Trader>> {
        sqlx::query_as::<_, Trader>(
            "SELECT id, address, first_seen_at, last_updated_at, is_active, discovery_source
             FROM traders WHERE address = $1",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await
        .context("get_trader failed")
    }

    pub async fn active_traders(&self) -> Result<Vec<Trader>> {
        sqlx::query_as::<_, Trader>(
            "SELECT id, address, first_seen_at, last_updated_at, is_active, discovery_source
             FROM traders WHERE is_active ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("active_traders failed")
    }

    /// Subscribe/unsubscribe toggles activity; rows are never deleted.
    pub async fn set_trader_active(&self, address: &str, active: bool) -> Result<()> {
        sqlx::query(
            "UPDATE traders SET is_active = $2, last_updated_at = now() WHERE address = $1",
        )
        .bind(address)
        .bind(active)
        .execute(&self.pool)
        .await
        .context("set_trader_active failed")?;
        Ok(())
    }

    /// Every address the system has ever seen: trader table plus queue.
    /// Hydrates the capture module's `known` set at startup.
    pub async fn known_addresses(&self) -> Result<Vec<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT address FROM traders
             UNION
             SELECT address FROM trader_discovery_queue",
        )
        .fetch_all(&self.pool)
        .await
        .context("known_addresses failed")
    }

    // =========================================================================
    // Trades & funding
    // =========================================================================

    /// Bulk-insert fills, ignoring rows already present (idempotent on
    /// upstream tid).
    pub async fn insert_trades(&self, trader_id: i64, trades: &[Trade]) -> Result<u64> {
        let mut inserted = 0u64;
        for chunk in trades.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
                "INSERT INTO trades (trader_id, tid, coin, side, size, price, closed_pnl, fee, \
                 timestamp, is_liquidation, direction, start_position, tx_hash, oid) ",
            );
            qb.push_values(chunk, |mut row, t| {
                row.push_bind(trader_id)
                    .push_bind(t.tid)
                    .push_bind(&t.coin)
                    .push_bind(t.side.as_str())
                    .push_bind(t.size)
                    .push_bind(t.price)
                    .push_bind(t.closed_pnl)
                    .push_bind(t.fee)
                    .push_bind(t.timestamp)
                    .push_bind(t.is_liquidation)
                    .push_bind(&t.direction)
                    .push_bind(t.start_position)
                    .push_bind(&t.tx_hash)
                    .push_bind(t.oid);
            });
            qb.push(" ON CONFLICT (trader_id, tid, timestamp) DO NOTHING");

            let result = qb
                .build()
                .execute(&self.pool)
                .await
                .context("insert_trades failed")?;
            inserted += result.rows_affected();
        }
        if inserted > 0 {
            debug!(trader_id, inserted, "trade rows written");
        }
        Ok(inserted)
    }

    /// Bulk-insert funding payments, idempotent on (trader, coin, time).
    pub async fn insert_funding(
        &self,
        trader_id: i64,
        payments: &[FundingPayment],
    ) -> Result<u64> {
        let mut inserted = 0u64;
        for chunk in payments.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
                "INSERT INTO funding_payments (trader_id, coin, funding_rate, payment, \
                 position_size_at_time, timestamp) ",
            );
            qb.push_values(chunk, |mut row, p| {
                row.push_bind(trader_id)
                    .push_bind(&p.coin)
                    .push_bind(p.funding_rate)
                    .push_bind(p.payment)
                    .push_bind(p.position_size_at_time)
                    .push_bind(p.timestamp);
            });
            qb.push(" ON CONFLICT (trader_id, coin, timestamp) DO NOTHING");

            let result = qb
                .build()
                .execute(&self.pool)
                .await
                .context("insert_funding failed")?;
            inserted += result.rows_affected();
        }
        Ok(inserted)
    }

    pub async fn count_fills_in_range(
        &self,
        trader_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<i64> {
        sqlx::query_scalar::<_, i64>(
            "SELECT count(*) FROM trades
             WHERE trader_id = $1 AND timestamp >= $2 AND timestamp < $3",
        )
        .bind(trader_id)
        .bind(from)
        .bind(to)
        .fetch_one(&self.pool)
        .await
        .context("count_fills_in_range failed")
    }

    /// Aggregates for state rehydration at boot. `flip_count` leans on the
    /// upstream's direction labels; synthesized fills use the same
    /// vocabulary.
    pub async fn trade_aggregates(&self, trader_id: i64) -> Result<TradeAggregates> {
        sqlx::query_as::<_, TradeAggregates>(
            r#"
            SELECT sum(closed_pnl)                                   AS trading_pnl,
                   sum(fee)                                          AS total_fees,
                   sum(size * price)                                 AS total_volume,
                   count(*)                                          AS trade_count,
                   count(*) FILTER (WHERE is_liquidation)            AS liquidation_count,
                   count(*) FILTER (WHERE direction IN
                       ('Long > Short', 'Short > Long'))             AS flip_count,
                   max(timestamp)                                    AS last_trade_at
            FROM trades WHERE trader_id = $1
            "#,
        )
        .bind(trader_id)
        .fetch_one(&self.pool)
        .await
        .context("trade_aggregates failed")
    }

    pub async fn funding_aggregates(&self, trader_id: i64) -> Result<FundingAggregates> {
        sqlx::query_as::<_, FundingAggregates>(
            "SELECT sum(payment) AS funding_pnl, max(timestamp) AS last_funding_at
             FROM funding_payments WHERE trader_id = $1",
        )
        .bind(trader_id)
        .fetch_one(&self.pool)
        .await
        .context("funding_aggregates failed")
    }

    // =========================================================================
    // Snapshots
    // =========================================================================

    /// Multi-row upsert. Identical re-writes are no-ops at the data level;
    /// same-key conflicts resolve last-writer-wins.
    pub async fn upsert_snapshots(&self, snapshots: &[PnlSnapshot]) -> Result<u64> {
        let mut written = 0u64;
        for chunk in snapshots.chunks(INSERT_CHUNK) {
            let mut qb: QueryBuilder<sqlx::Postgres> = QueryBuilder::new(
                "INSERT INTO pnl_snapshots (trader_id, timestamp, realized_pnl, unrealized_pnl, \
                 total_pnl, funding_pnl, trading_pnl, open_positions, total_volume, account_value) ",
            );
            qb.push_values(chunk, |mut row, s| {
                row.push_bind(s.trader_id)
                    .push_bind(s.timestamp)
                    .push_bind(s.realized_pnl)
                    .push_bind(s.unrealized_pnl)
                    .push_bind(s.total_pnl)
                    .push_bind(s.funding_pnl)
                    .push_bind(s.trading_pnl)
                    .push_bind(s.open_positions)
                    .push_bind(s.total_volume)
                    .push_bind(s.account_value);
            });
            qb.push(
                " ON CONFLICT (trader_id, timestamp) DO UPDATE SET \
                 realized_pnl = EXCLUDED.realized_pnl, \
                 unrealized_pnl = EXCLUDED.unrealized_pnl, \
                 total_pnl = EXCLUDED.total_pnl, \
                 funding_pnl = EXCLUDED.funding_pnl, \
                 trading_pnl = EXCLUDED.trading_pnl, \
                 open_positions = EXCLUDED.open_positions, \
                 total_volume = EXCLUDED.total_volume, \
                 account_value = EXCLUDED.account_value",
            );

            let result = qb
                .build()
                .execute(&self.pool)
                .await
                .context("upsert_snapshots failed")?;
            written += result.rows_affected();
        }
        Ok(written)
    }

    pub async fn snapshots_in_range(
        &self,
        trader_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PnlSnapshot>> {
        sqlx::query_as::<_, PnlSnapshot>(
            "SELECT trader_id, timestamp, realized_pnl, unrealized_pnl, total_pnl, funding_pnl, \
                    trading_pnl, open_positions, total_volume, account_value
             FROM pnl_snapshots
             WHERE trader_id = $1 AND timestamp >= $2 AND timestamp < $3
             ORDER BY timestamp",
        )
        .bind(trader_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .context("snapshots_in_range failed")
    }

    /// Snapshot timestamps only; the gap scan needs nothing else.
    pub async fn snapshot_times(
        &self,
        trader_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DateTime<Utc>>> {
        sqlx::query_scalar::<_, DateTime<Utc>>(
            "SELECT timestamp FROM pnl_snapshots
             WHERE trader_id = $1 AND timestamp >= $2 AND timestamp < $3
             ORDER BY timestamp",
        )
        .bind(trader_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .context("snapshot_times failed")
    }

    pub async fn latest_snapshot(&self, trader_id: i64) -> Result<Option<PnlSnapshot>> {
        sqlx::query_as::<_, PnlSnapshot>(
            "SELECT trader_id, timestamp, realized_pnl, unrealized_pnl, total_pnl, funding_pnl, \
                    trading_pnl, open_positions, total_volume, account_value
             FROM pnl_snapshots WHERE trader_id = $1
             ORDER BY timestamp DESC LIMIT 1",
        )
        .bind(trader_id)
        .fetch_optional(&self.pool)
        .await
        .context("latest_snapshot failed")
    }

    // =========================================================================
    // Data gaps
    // =========================================================================

    pub async fn insert_gap(
        &self,
        trader_id: i64,
        gap_start: DateTime<Utc>,
        gap_end: DateTime<Utc>,
        gap_type: GapType,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO data_gaps (trader_id, gap_start, gap_end, gap_type)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (trader_id, gap_start, gap_type)
             DO UPDATE SET gap_end = GREATEST(data_gaps.gap_end, EXCLUDED.gap_end)",
        )
        .bind(trader_id)
        .bind(gap_start)
        .bind(gap_end)
        .bind(gap_type.to_string())
        .execute(&self.pool)
        .await
        .context("insert_gap failed")?;
        Ok(())
    }

    pub async fn open_gaps(&self, trader_id: i64) -> Result<Vec<DataGap>> {
        sqlx::query_as::<_, DataGap>(
            "SELECT id, trader_id, gap_start, gap_end, gap_type, detected_at, resolved_at
             FROM data_gaps WHERE trader_id = $1 AND resolved_at IS NULL
             ORDER BY gap_start",
        )
        .bind(trader_id)
        .fetch_all(&self.pool)
        .await
        .context("open_gaps failed")
    }

    pub async fn resolve_gap(&self, gap_id: i64) -> Result<()> {
        sqlx::query("UPDATE data_gaps SET resolved_at = now() WHERE id = $1")
            .bind(gap_id)
            .execute(&self.pool)
            .await
            .context("resolve_gap failed")?;
        Ok(())
    }

    /// Open gaps overlapping `[from, to)`, for data-status reporting.
    pub async fn gaps_overlapping(
        &self,
        trader_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<DataGap>> {
        sqlx::query_as::<_, DataGap>(
            "SELECT id, trader_id, gap_start, gap_end, gap_type, detected_at, resolved_at
             FROM data_gaps
             WHERE trader_id = $1 AND resolved_at IS NULL
               AND gap_start < $3 AND gap_end > $2
             ORDER BY gap_start",
        )
        .bind(trader_id)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await
        .context("gaps_overlapping failed")
    }

    // =========================================================================
    // Discovery queue
    // =========================================================================

    /// Bulk enqueue; addresses already queued (or processed) are ignored.
    pub async fn enqueue_discoveries(
        &self,
        items: &[(String, DiscoverySource, i32)],
    ) -> Result<u64> {
        if items.is_empty() {
            return Ok(0);
        }
        let mut qb: QueryBuilder<sqlx::Postgres> =
            QueryBuilder::new("INSERT INTO trader_discovery_queue (address, source, priority) ");
        qb.push_values(items, |mut row, (address, source, priority)| {
            row.push_bind(address)
                .push_bind(source.to_string())
                .push_bind(priority);
        });
        qb.push(" ON CONFLICT (address) DO NOTHING");

        let result = qb
            .build()
            .execute(&self.pool)
            .await
            .context("enqueue_discoveries failed")?;
        Ok(result.rows_affected())
    }

    /// Unprocessed entries with non-negative priority, best first.
    pub async fn pending_discoveries(&self, limit: i64) -> Result<Vec<DiscoveryItem>> {
        sqlx::query_as::<_, DiscoveryItem>(
            "SELECT address, source, priority, discovered_at, processed_at, notes
             FROM trader_discovery_queue
             WHERE processed_at IS NULL AND priority >= 0
             ORDER BY priority DESC, discovered_at ASC
             LIMIT $1",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("pending_discoveries failed")
    }

    /// Transition Pending -> Processed(result). Exactly once: a second call
    /// for the same address leaves the first result in place.
    pub async fn mark_discovery_processed(&self, address: &str, result: &str) -> Result<()> {
        sqlx::query(
            "UPDATE trader_discovery_queue
             SET processed_at = now(), notes = $2
             WHERE address = $1 AND processed_at IS NULL",
        )
        .bind(address)
        .bind(result)
        .execute(&self.pool)
        .await
        .context("mark_discovery_processed failed")?;
        Ok(())
    }

    // =========================================================================
    // Backfill jobs
    // =========================================================================

    /// Enqueue a job; returns false when the idempotency key already exists.
    pub async fn enqueue_backfill_job(
        &self,
        job_id: &str,
        trader_id: i64,
        address: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "INSERT INTO backfill_jobs (job_id, trader_id, address, start_time, end_time)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (job_id) DO NOTHING",
        )
        .bind(job_id)
        .bind(trader_id)
        .bind(address)
        .bind(start_time)
        .bind(end_time)
        .execute(&self.pool)
        .await
        .context("enqueue_backfill_job failed")?;
        Ok(result.rows_affected() > 0)
    }

    /// Claim the next runnable job. SKIP LOCKED keeps concurrent workers
    /// from ever claiming the same row.
    pub async fn claim_backfill_job(&self) -> Result<Option<BackfillJob>> {
        sqlx::query_as::<_, BackfillJob>(
            r#"
            UPDATE backfill_jobs SET status = 'active', updated_at = now()
            WHERE job_id = (
                SELECT job_id FROM backfill_jobs
                WHERE status = 'waiting' AND next_run_at <= now()
                ORDER BY next_run_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING job_id, trader_id, address, start_time, end_time, status, attempts,
                      next_run_at, progress, last_error, created_at, updated_at
            "#,
        )
        .fetch_optional(&self.pool)
        .await
        .context("claim_backfill_job failed")
    }

    /// Progress is monotonic by contract; callers only ever report forward
    /// movement.
    pub async fn update_job_progress(
        &self,
        job_id: &str,
        progress: serde_json::Value,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE backfill_jobs SET progress = $2, updated_at = now() WHERE job_id = $1",
        )
        .bind(job_id)
        .bind(progress)
        .execute(&self.pool)
        .await
        .context("update_job_progress failed")?;
        Ok(())
    }

    pub async fn complete_job(&self, job_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE backfill_jobs SET status = 'completed', updated_at = now() WHERE job_id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("complete_job failed")?;
        Ok(())
    }

    /// Record a failed attempt: back to waiting with exponential delay while
    /// the retry budget lasts, terminal 'failed' after that.
    pub async fn fail_job(&self, job_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE backfill_jobs SET
                attempts = attempts + 1,
                last_error = $2,
                status = CASE WHEN attempts + 1 >= $3 THEN 'failed' ELSE 'waiting' END,
                next_run_at = now() + ($4 * power(2, attempts)) * interval '1 second',
                updated_at = now()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .bind(JOB_MAX_ATTEMPTS)
        .bind(JOB_RETRY_BASE_SECS as f64)
        .execute(&self.pool)
        .await
        .context("fail_job failed")?;
        Ok(())
    }

    /// Shutdown path: hand an in-flight job back to the queue untouched.
    pub async fn release_job(&self, job_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE backfill_jobs SET status = 'waiting', updated_at = now()
             WHERE job_id = $1 AND status = 'active'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .context("release_job failed")?;
        Ok(())
    }

    /// All jobs for one address, newest first. Backs the status endpoint.
    pub async fn jobs_for_address(&self, address: &str) -> Result<Vec<BackfillJob>> {
        sqlx::query_as::<_, BackfillJob>(
            "SELECT job_id, trader_id, address, start_time, end_time, status, attempts,
                    next_run_at, progress, last_error, created_at, updated_at
             FROM backfill_jobs WHERE address = $1
             ORDER BY created_at DESC",
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await
        .context("jobs_for_address failed")
    }

    /// Jobs stranded in 'active' by an unclean shutdown get re-queued after
    /// a grace period. Called once at boot.
    pub async fn requeue_stale_active_jobs(&self, grace: ChronoDuration) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE backfill_jobs SET status = 'waiting', updated_at = now()
             WHERE status = 'active' AND updated_at < $1",
        )
        .bind(Utc::now() - grace)
        .execute(&self.pool)
        .await
        .context("requeue_stale_active_jobs failed")?;
        Ok(result.rows_affected())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("pool_size", &self.pool.size())
            .finish()
    }
}
