// =============================================================================
// Upstream HTTP client — single POST /info endpoint
// =============================================================================
//
// The upstream multiplexes every read operation over one URL; the `type`
// field of the JSON body selects the operation. All calls withdraw their
// weight from the shared rate budget before the request is sent, including
// retries — a retry is a real request as far as the upstream is concerned.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};

use crate::types::{FundingPayment, Trade};
use crate::upstream::messages::{
    AllMids, ClearinghouseState, FillsPage, WireFill, WireFundingEvent, WireMarketTrade,
    WirePortfolio, FILLS_RESPONSE_CAP,
};
use crate::upstream::rate_limit::{weight, RateBudget};
use crate::upstream::UpstreamError;

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Safety bound on cap-driven paging within one fills window.
const MAX_FILL_PAGES: usize = 10;

// -----------------------------------------------------------------------------
// Retry policy
// -----------------------------------------------------------------------------

/// Explicit retry/backoff policy. Kept as a value so callers can see and
/// test the exact schedule instead of it being buried in a helper.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
    /// Symmetric jitter as a fraction of the computed delay (0.2 = ±20 %).
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(30),
            jitter_fraction: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): exponential from
    /// `base`, capped, jittered.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(attempt as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        let jitter = if self.jitter_fraction > 0.0 {
            let spread = capped * self.jitter_fraction;
            rand::thread_rng().gen_range(-spread..=spread)
        } else {
            0.0
        };
        Duration::from_secs_f64((capped + jitter).max(0.0))
    }
}

// -----------------------------------------------------------------------------
// InfoClient
// -----------------------------------------------------------------------------

/// Client for the upstream `/info` endpoint.
#[derive(Clone)]
pub struct InfoClient {
    http: reqwest::Client,
    info_url: String,
    budget: Arc<RateBudget>,
    retry: RetryPolicy,
}

impl InfoClient {
    pub fn new(base_url: &str, budget: Arc<RateBudget>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        Self {
            http,
            info_url: format!("{}/info", base_url.trim_end_matches('/')),
            budget,
            retry: RetryPolicy::default(),
        }
    }

    // -------------------------------------------------------------------------
    // Operations
    // -------------------------------------------------------------------------

    /// Current positions and margin for one account.
    pub async fn clearinghouse_state(
        &self,
        address: &str,
    ) -> Result<ClearinghouseState, UpstreamError> {
        self.post(
            weight::CLEARINGHOUSE_STATE,
            json!({"type": "clearinghouseState", "user": address}),
        )
        .await
    }

    /// One page of fills inside `[start_ms, end_ms]`. The upstream caps the
    /// response at 2 000 entries; `FillsPage::capped` reports whether the cap
    /// was hit so the caller can page.
    pub async fn user_fills_by_time(
        &self,
        address: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<FillsPage, UpstreamError> {
        let wire: Vec<WireFill> = self
            .post(
                weight::USER_FILLS,
                json!({
                    "type": "userFillsByTime",
                    "user": address,
                    "startTime": start_ms,
                    "endTime": end_ms,
                }),
            )
            .await?;

        let capped = wire.len() == FILLS_RESPONSE_CAP;
        let fills = convert_lossy(wire, WireFill::into_trade, "fill");
        Ok(FillsPage { fills, capped })
    }

    /// All fills inside `[start_ms, end_ms]`, paging past the 2 000-entry cap.
    ///
    /// Probed behaviour: a capped window returns the *oldest* 2 000 entries,
    /// so paging advances `start` past the newest fill seen. `capped` on the
    /// returned page stays set if the page budget ran out before the window
    /// was exhausted.
    pub async fn user_fills_window(
        &self,
        address: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<FillsPage, UpstreamError> {
        let mut all: Vec<Trade> = Vec::new();
        let mut cursor = start_ms;
        let mut truncated = false;

        for page in 0..MAX_FILL_PAGES {
            let mut batch = self.user_fills_by_time(address, cursor, end_ms).await?;
            let capped = batch.capped;
            batch.fills.sort_by_key(|t| (t.timestamp, t.tid));
            let newest = batch.fills.last().map(|t| t.timestamp.timestamp_millis());
            all.append(&mut batch.fills);

            if !capped {
                break;
            }
            match newest {
                // Same-millisecond bursts could loop forever without the +1.
                Some(ts) if ts + 1 > cursor => cursor = ts + 1,
                _ => {
                    truncated = true;
                    break;
                }
            }
            if page == MAX_FILL_PAGES - 1 {
                warn!(address, "fill paging budget exhausted, window truncated");
                truncated = true;
            }
        }

        Ok(FillsPage {
            fills: all,
            capped: truncated,
        })
    }

    /// Funding payments inside `[start_ms, end_ms]`.
    pub async fn user_funding(
        &self,
        address: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<FundingPayment>, UpstreamError> {
        let wire: Vec<WireFundingEvent> = self
            .post(
                weight::USER_FUNDING,
                json!({
                    "type": "userFunding",
                    "user": address,
                    "startTime": start_ms,
                    "endTime": end_ms,
                }),
            )
            .await?;
        Ok(convert_lossy(wire, WireFundingEvent::into_payment, "funding"))
    }

    /// Upstream-computed portfolio summary per standard period. Trusted as
    /// authoritative; recorded with provenance, never recomputed.
    pub async fn portfolio(&self, address: &str) -> Result<WirePortfolio, UpstreamError> {
        self.post(
            weight::PORTFOLIO,
            json!({"type": "portfolio", "user": address}),
        )
        .await
    }

    /// Recent coin-level trades.
    pub async fn recent_trades(&self, coin: &str) -> Result<Vec<WireMarketTrade>, UpstreamError> {
        self.post(
            weight::RECENT_TRADES,
            json!({"type": "recentTrades", "coin": coin}),
        )
        .await
    }

    /// Current mid price per coin.
    pub async fn all_mids(&self) -> Result<AllMids, UpstreamError> {
        self.post(weight::ALL_MIDS, json!({"type": "allMids"})).await
    }

    // -------------------------------------------------------------------------
    // Transport
    // -------------------------------------------------------------------------

    /// POST the body and decode the response, retrying transient failures
    /// per the retry policy. Terminal 4xx is returned immediately.
    async fn post<T: DeserializeOwned>(
        &self,
        op_weight: u32,
        body: serde_json::Value,
    ) -> Result<T, UpstreamError> {
        let mut last_err: Option<UpstreamError> = None;

        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = match &last_err {
                    Some(UpstreamError::RateLimited {
                        retry_after_secs: Some(secs),
                    }) => Duration::from_secs(*secs),
                    _ => self.retry.delay_for(attempt - 1),
                };
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying upstream request");
                tokio::time::sleep(delay).await;
            }

            self.budget.acquire(op_weight).await;

            match self.send_once(&body).await {
                Ok(value) => {
                    return serde_json::from_value(value)
                        .map_err(|e| UpstreamError::Schema(e.to_string()));
                }
                Err(err) if err.is_transient() => last_err = Some(err),
                Err(err) => return Err(err),
            }
        }

        Err(last_err
            .unwrap_or_else(|| UpstreamError::Transient("retries exhausted".to_string())))
    }

    async fn send_once(
        &self,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, UpstreamError> {
        let resp = self
            .http
            .post(&self.info_url)
            .json(body)
            .send()
            .await
            .map_err(|e| UpstreamError::Transient(e.to_string()))?;

        let status = resp.status();

        if status.as_u16() == 429 {
            let retry_after_secs = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            return Err(UpstreamError::RateLimited { retry_after_secs });
        }

        if status.is_server_error() {
            return Err(UpstreamError::Transient(format!("status {status}")));
        }

        if status.is_client_error() {
            let text = resp.text().await.unwrap_or_default();
            return Err(UpstreamError::Fatal {
                status: status.as_u16(),
                body: text.chars().take(512).collect(),
            });
        }

        resp.json::<serde_json::Value>()
            .await
            .map_err(|e| UpstreamError::Schema(e.to_string()))
    }
}

impl std::fmt::Debug for InfoClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfoClient")
            .field("info_url", &self.info_url)
            .finish()
    }
}

/// Convert wire records, logging one sample failure and skipping the rest of
/// the malformed entries. A bad record never stops ingestion.
fn convert_lossy<W, T, E: std::fmt::Display>(
    wire: Vec<W>,
    convert: impl Fn(W) -> Result<T, E>,
    kind: &str,
) -> Vec<T> {
    let mut out = Vec::with_capacity(wire.len());
    let mut logged = false;
    for record in wire {
        match convert(record) {
            Ok(value) => out.push(value),
            Err(e) => {
                if !logged {
                    warn!(kind, error = %e, "skipping malformed upstream record");
                    logged = true;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delays_are_exponential_and_capped() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(8),
            jitter_fraction: 0.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(2));
        assert_eq!(policy.delay_for(2), Duration::from_secs(4));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
    }

    #[test]
    fn retry_jitter_stays_in_band() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base: Duration::from_secs(10),
            cap: Duration::from_secs(10),
            jitter_fraction: 0.2,
        };
        for _ in 0..100 {
            let d = policy.delay_for(0).as_secs_f64();
            assert!((8.0..=12.0).contains(&d), "delay {d} outside ±20% band");
        }
    }

    #[test]
    fn convert_lossy_skips_bad_records() {
        let wire = vec!["1", "x", "3"];
        let out = convert_lossy(
            wire,
            |s: &str| s.parse::<i32>().map_err(|e| e.to_string()),
            "test",
        );
        assert_eq!(out, vec![1, 3]);
    }
}
