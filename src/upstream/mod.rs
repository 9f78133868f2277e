// =============================================================================
// Upstream protocol client — HTTP /info + WebSocket, rate-budget aware
// =============================================================================

pub mod http;
pub mod messages;
pub mod rate_limit;
pub mod ws;

use thiserror::Error;

/// Errors produced by the upstream client. The split matters for policy:
/// transient errors are retried, fatal ones fail the enclosing unit of work,
/// schema errors skip the record and keep ingesting.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Network-level failure, 5xx, or timeout. Retryable.
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// 429 with an optional Retry-After hint in seconds. Retryable after the
    /// hinted delay.
    #[error("upstream rate limited (retry after {retry_after_secs:?}s)")]
    RateLimited { retry_after_secs: Option<u64> },

    /// 4xx other than 429. Not retryable.
    #[error("fatal upstream error: status {status}: {body}")]
    Fatal { status: u16, body: String },

    /// Response decoded but did not match the expected shape. The record is
    /// skipped; ingestion continues.
    #[error("upstream schema mismatch: {0}")]
    Schema(String),

    /// The address failed validation before any request was made.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
}

impl UpstreamError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::RateLimited { .. })
    }
}

/// Validate an Ethereum-style address: `0x` followed by exactly 40 hex
/// digits. Case is accepted; normalization lowercases.
pub fn is_valid_address(address: &str) -> bool {
    let Some(hex) = address.strip_prefix("0x") else {
        return false;
    };
    hex.len() == 40 && hex.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Lowercase an address after validating it. Every address entering the
/// system passes through here exactly once.
pub fn normalize_address(address: &str) -> Result<String, UpstreamError> {
    let trimmed = address.trim();
    if !is_valid_address(trimmed) {
        return Err(UpstreamError::InvalidAddress(trimmed.to_string()));
    }
    Ok(trimmed.to_ascii_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_checksummed_and_lowercase() {
        assert!(is_valid_address(
            "0xAb5801a7D398351b8bE11C439e05C5b3259aeC9B"
        ));
        assert!(is_valid_address(
            "0xab5801a7d398351b8be11c439e05c5b3259aec9b"
        ));
    }

    #[test]
    fn rejects_malformed() {
        assert!(!is_valid_address(""));
        assert!(!is_valid_address("0x123"));
        assert!(!is_valid_address("ab5801a7d398351b8be11c439e05c5b3259aec9b"));
        assert!(!is_valid_address(
            "0xzz5801a7d398351b8be11c439e05c5b3259aec9b"
        ));
        assert!(!is_valid_address(
            "0xab5801a7d398351b8be11c439e05c5b3259aec9b00"
        ));
    }

    #[test]
    fn normalize_lowercases() {
        let norm = normalize_address(" 0xAb5801a7D398351b8bE11C439e05C5b3259aeC9B ").unwrap();
        assert_eq!(norm, "0xab5801a7d398351b8be11c439e05c5b3259aec9b");
        assert!(normalize_address("0x123").is_err());
    }

    #[test]
    fn transient_classification() {
        assert!(UpstreamError::Transient("timeout".into()).is_transient());
        assert!(UpstreamError::RateLimited {
            retry_after_secs: Some(2)
        }
        .is_transient());
        assert!(!UpstreamError::Fatal {
            status: 422,
            body: "bad".into()
        }
        .is_transient());
        assert!(!UpstreamError::Schema("oops".into()).is_transient());
    }
}
