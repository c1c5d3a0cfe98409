//! Account fallback policy
//!
//! Classifies an upstream failure into "try the next account after a
//! cooldown" or "fatal for this request". Backoff is purely reactive; the
//! gateway never does proactive quota arithmetic.

use std::time::Duration;

const THIRTY_MINUTES: u64 = 30 * 60 * 1000;
const TWENTY_FOUR_HOURS: u64 = 24 * 60 * 60 * 1000;
const MAX_BACKOFF_MS: u64 = 120_000;

/// What to do with the connection after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackDecision {
    /// Try the next eligible account
    pub should_fallback: bool,
    /// How long this account stays out of rotation
    pub cooldown_ms: u64,
}

impl FallbackDecision {
    pub fn fatal() -> Self {
        Self { should_fallback: false, cooldown_ms: 0 }
    }

    pub fn retry_after(cooldown_ms: u64) -> Self {
        Self { should_fallback: true, cooldown_ms }
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Classify an upstream failure
///
/// `status` is None for network errors and client aborts. `retry_after_ms`
/// is the server-specified delay when one was sent (Retry-After header or an
/// Antigravity retry hint in the error body).
pub fn classify(
    status: Option<u16>,
    retry_after_ms: Option<u64>,
    consecutive_failures: u32,
) -> FallbackDecision {
    match status {
        None => FallbackDecision::retry_after(10_000),
        Some(429) => {
            let cooldown = retry_after_ms.unwrap_or_else(|| backoff_ms(consecutive_failures));
            FallbackDecision::retry_after(cooldown)
        }
        Some(401) | Some(403) => FallbackDecision::retry_after(THIRTY_MINUTES),
        Some(402) | Some(451) => FallbackDecision::retry_after(TWENTY_FOUR_HOURS),
        Some(s) if s >= 500 => FallbackDecision::retry_after(60_000),
        Some(_) => FallbackDecision::fatal(),
    }
}

// min(2^n, 120_000) ms, where n is the consecutive-failure count
fn backoff_ms(consecutive_failures: u32) -> u64 {
    1u64.checked_shl(consecutive_failures.min(30)).unwrap_or(MAX_BACKOFF_MS).min(MAX_BACKOFF_MS)
}

/// Parse a Retry-After header value (delta-seconds form) into milliseconds
pub fn parse_retry_after(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok().map(|seconds| seconds * 1000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_uses_server_delay() {
        let decision = classify(Some(429), Some(5_000), 0);
        assert!(decision.should_fallback);
        assert_eq!(decision.cooldown_ms, 5_000);
    }

    #[test]
    fn test_rate_limit_exponential_backoff() {
        assert_eq!(classify(Some(429), None, 4).cooldown_ms, 16);
        assert_eq!(classify(Some(429), None, 10).cooldown_ms, 1024);
        // Capped at two minutes
        assert_eq!(classify(Some(429), None, 30).cooldown_ms, MAX_BACKOFF_MS);
        assert_eq!(classify(Some(429), None, 63).cooldown_ms, MAX_BACKOFF_MS);
    }

    #[test]
    fn test_auth_failures_cool_for_thirty_minutes() {
        for status in [401u16, 403] {
            let decision = classify(Some(status), None, 0);
            assert!(decision.should_fallback);
            assert_eq!(decision.cooldown_ms, THIRTY_MINUTES);
        }
    }

    #[test]
    fn test_quota_exhaustion_cools_for_a_day() {
        for status in [402u16, 451] {
            assert_eq!(classify(Some(status), None, 0).cooldown_ms, TWENTY_FOUR_HOURS);
        }
    }

    #[test]
    fn test_server_errors_cool_for_a_minute() {
        let decision = classify(Some(503), None, 0);
        assert!(decision.should_fallback);
        assert_eq!(decision.cooldown_ms, 60_000);
    }

    #[test]
    fn test_client_errors_are_fatal() {
        for status in [400u16, 404, 422] {
            assert!(!classify(Some(status), None, 0).should_fallback);
        }
    }

    #[test]
    fn test_network_errors_retry_quickly() {
        let decision = classify(None, None, 0);
        assert!(decision.should_fallback);
        assert_eq!(decision.cooldown_ms, 10_000);
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("30"), Some(30_000));
        assert_eq!(parse_retry_after(" 5 "), Some(5_000));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2026"), None);
    }
}
