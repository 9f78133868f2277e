// =============================================================================
// Configuration — environment-driven boot settings
// =============================================================================
//
// Every tunable is read once at boot from the environment. There is no hot
// reload: the knobs here (URLs, intervals, pool sizes) all require restarting
// the ingestion tasks anyway. Invalid configuration aborts the process with a
// non-zero exit; it is the only class of error allowed to do so.
// =============================================================================

use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::info;

// -----------------------------------------------------------------------------
// Defaults
// -----------------------------------------------------------------------------

fn default_upstream_base_url() -> String {
    "https://api.hyperliquid.xyz".to_string()
}

fn default_websocket_url() -> String {
    "wss://api.hyperliquid.xyz/ws".to_string()
}

fn default_port() -> u16 {
    3001
}

/// Snapshot poll interval: 5 minutes.
fn default_poll_interval_ms() -> u64 {
    300_000
}

fn default_backfill_days() -> u32 {
    30
}

/// Funding reconciliation interval: 1 hour.
fn default_funding_poll_interval_ms() -> u64 {
    3_600_000
}

fn default_db_max_connections() -> u32 {
    20
}

// -----------------------------------------------------------------------------
// Config
// -----------------------------------------------------------------------------

/// Boot configuration for the indexer.
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the upstream HTTP API; `/info` is appended per request.
    pub upstream_base_url: String,
    /// Upstream WebSocket endpoint.
    pub websocket_url: String,
    /// Postgres/TimescaleDB DSN. Required.
    pub database_url: String,
    /// Read-API bind port.
    pub port: u16,
    /// When false, WS fill subscriptions are disabled and every tracked
    /// trader is covered by the snapshot poll alone.
    pub use_hybrid_mode: bool,
    /// Interval between snapshot poll rounds.
    pub poll_interval: Duration,
    /// Default historical window for newly scheduled backfills.
    pub backfill_days: u32,
    /// Interval between funding reconciliation rounds.
    pub funding_poll_interval: Duration,
    /// Upper bound on the sqlx pool.
    pub db_max_connections: u32,
}

impl Config {
    /// Read configuration from the environment.
    ///
    /// `DATABASE_URL` is required; everything else has a default. Interval
    /// values are validated to be non-zero so a typo'd `0` cannot turn a
    /// poll loop into a busy spin.
    pub fn from_env() -> Result<Self> {
        let database_url =
            std::env::var("DATABASE_URL").context("DATABASE_URL must be set")?;

        let config = Self {
            upstream_base_url: env_or("UPSTREAM_BASE_URL", default_upstream_base_url()),
            websocket_url: env_or("WEBSOCKET_URL", default_websocket_url()),
            database_url,
            port: parse_env("PORT", default_port())?,
            use_hybrid_mode: parse_env("USE_HYBRID_MODE", true)?,
            poll_interval: Duration::from_millis(parse_env(
                "POLL_INTERVAL_MS",
                default_poll_interval_ms(),
            )?),
            backfill_days: parse_env("BACKFILL_DAYS", default_backfill_days())?,
            funding_poll_interval: Duration::from_millis(parse_env(
                "FUNDING_POLL_INTERVAL_MS",
                default_funding_poll_interval_ms(),
            )?),
            db_max_connections: parse_env("DB_MAX_CONNECTIONS", default_db_max_connections())?,
        };

        config.validate()?;

        info!(
            upstream = %config.upstream_base_url,
            ws = %config.websocket_url,
            port = config.port,
            hybrid = config.use_hybrid_mode,
            poll_interval_s = config.poll_interval.as_secs(),
            backfill_days = config.backfill_days,
            "configuration loaded"
        );

        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.poll_interval.is_zero() {
            bail!("POLL_INTERVAL_MS must be > 0");
        }
        if self.funding_poll_interval.is_zero() {
            bail!("FUNDING_POLL_INTERVAL_MS must be > 0");
        }
        if self.backfill_days == 0 {
            bail!("BACKFILL_DAYS must be > 0");
        }
        if self.db_max_connections == 0 {
            bail!("DB_MAX_CONNECTIONS must be > 0");
        }
        if !self.upstream_base_url.starts_with("http") {
            bail!("UPSTREAM_BASE_URL must be an http(s) URL");
        }
        if !self.websocket_url.starts_with("ws") {
            bail!("WEBSOCKET_URL must be a ws(s) URL");
        }
        Ok(())
    }
}

fn env_or(key: &str, default: String) -> String {
    std::env::var(key).unwrap_or(default)
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}='{raw}': {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Config {
        Config {
            upstream_base_url: default_upstream_base_url(),
            websocket_url: default_websocket_url(),
            database_url: "postgres://localhost/pnl".into(),
            port: default_port(),
            use_hybrid_mode: true,
            poll_interval: Duration::from_millis(default_poll_interval_ms()),
            backfill_days: default_backfill_days(),
            funding_poll_interval: Duration::from_millis(default_funding_poll_interval_ms()),
            db_max_connections: default_db_max_connections(),
        }
    }

    #[test]
    fn defaults_validate() {
        assert!(base().validate().is_ok());
        assert_eq!(base().poll_interval, Duration::from_secs(300));
        assert_eq!(base().backfill_days, 30);
    }

    #[test]
    fn zero_intervals_rejected() {
        let mut cfg = base();
        cfg.poll_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.backfill_days = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn url_schemes_checked() {
        let mut cfg = base();
        cfg.websocket_url = "https://not-a-ws".into();
        assert!(cfg.validate().is_err());

        let mut cfg = base();
        cfg.upstream_base_url = "ftp://nope".into();
        assert!(cfg.validate().is_err());
    }
}
