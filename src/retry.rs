//! Retry policy: pure functions deciding whether to retry and how long to wait.
//!
//! Both functions are pure and take every input explicitly (error,
//! attempt number, config) so they can be exercised without a clock or
//! network; `delay_ms` takes jitter as a parameter instead of reaching
//! for a global RNG, so tests can pin it to the boundary of the jitter
//! window.

use crate::error::GatewayError;

#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

/// Decide whether `attempt_number` (1-based, the attempt that just failed)
/// should be followed by another attempt.
pub fn should_retry(error: &GatewayError, attempt_number: u32, config: &RetryConfig) -> bool {
    if attempt_number >= config.max_attempts {
        return false;
    }
    error.retryable()
}

/// Compute the backoff delay in milliseconds for `attempt_number` (1-based):
/// `base * 2^(attempt-1)`, jittered by `jitter` in `[-0.3, 0.3]`, capped at `max_delay_ms`.
///
/// `jitter` is a caller-supplied value in `[-0.3, 0.3]`; production callers draw it
/// from `fastrand::f64() * 0.6 - 0.3`, tests pin it to exercise the boundary.
pub fn delay_ms(attempt_number: u32, config: &RetryConfig, jitter: f64) -> u64 {
    debug_assert!((-0.3..=0.3).contains(&jitter));
    let exponent = attempt_number.saturating_sub(1).min(32);
    let base = config.base_delay_ms as f64 * 2f64.powi(exponent as i32);
    let jittered = base * (1.0 + jitter);
    jittered.round().clamp(0.0, config.max_delay_ms as f64) as u64
}

/// Draw a fresh jitter value in `[-0.3, 0.3]` for production use.
pub fn random_jitter() -> f64 {
    fastrand::f64() * 0.6 - 0.3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream_5xx() -> GatewayError {
        GatewayError::UpstreamError {
            status: 503,
            message: "x".into(),
            model: "m".into(),
            retryable_override: None,
        }
    }

    fn config_error() -> GatewayError {
        GatewayError::ConfigurationError { message: "x".into() }
    }

    #[test]
    fn stops_at_max_attempts() {
        let config = RetryConfig { max_attempts: 3, ..Default::default() };
        assert!(should_retry(&upstream_5xx(), 1, &config));
        assert!(should_retry(&upstream_5xx(), 2, &config));
        assert!(!should_retry(&upstream_5xx(), 3, &config));
    }

    #[test]
    fn non_retryable_errors_never_retry() {
        let config = RetryConfig::default();
        assert!(!should_retry(&config_error(), 1, &config));
    }

    #[test]
    fn explicit_retryable_override_is_honored_over_the_default() {
        let config = RetryConfig::default();
        let forced_no_retry = GatewayError::UpstreamError {
            status: 503,
            message: "x".into(),
            model: "m".into(),
            retryable_override: Some(false),
        };
        assert!(!should_retry(&forced_no_retry, 1, &config));

        let forced_retry = GatewayError::UpstreamError {
            status: 400,
            message: "x".into(),
            model: "m".into(),
            retryable_override: Some(true),
        };
        assert!(should_retry(&forced_retry, 1, &config));
    }

    #[test]
    fn delay_follows_exponential_backoff_within_jitter_bounds() {
        let config = RetryConfig { base_delay_ms: 1000, max_delay_ms: 30_000, max_attempts: 5 };
        for attempt in 1..=5u32 {
            let base = 1000.0 * 2f64.powi((attempt - 1) as i32);
            let lower = (0.7 * base).floor() as u64;
            let upper = ((1.3 * base).min(30_000.0)).ceil() as u64;
            let low = delay_ms(attempt, &config, -0.3);
            let high = delay_ms(attempt, &config, 0.3);
            assert!(low >= lower.saturating_sub(1), "attempt {attempt}: low {low} < {lower}");
            assert!(high <= upper + 1, "attempt {attempt}: high {high} > {upper}");
        }
    }

    #[test]
    fn delay_is_capped_at_max_delay() {
        let config = RetryConfig { base_delay_ms: 1000, max_delay_ms: 5000, max_attempts: 10 };
        let delay = delay_ms(10, &config, 0.3);
        assert_eq!(delay, 5000);
    }

    #[test]
    fn random_jitter_is_within_bounds() {
        for _ in 0..1000 {
            let j = random_jitter();
            assert!((-0.3..=0.3).contains(&j));
        }
    }
}
