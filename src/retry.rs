//! Retry with exponential backoff + jitter, and a per-key circuit breaker.

use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::warn;

use crate::error::CopierError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

/// `min(initial * base^attempt, max)`, then optionally scaled by a uniform
/// jitter factor in `[0, 1]` applied after capping.
pub fn calculate_backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let raw = policy.initial_delay_ms as f64 * policy.exponential_base.powi(attempt as i32);
    let capped = raw.min(policy.max_delay_ms as f64);
    let delay_ms = if policy.jitter {
        rand::thread_rng().gen_range(0.0..=capped)
    } else {
        capped
    };
    Duration::from_millis(delay_ms.round() as u64)
}

/// Run `f` up to `policy.max_attempts + 1` total times. Retries only while
/// the returned error classifies as retryable; any other error (or
/// exhaustion) is returned immediately.
pub async fn with_retry<F, Fut, T>(policy: &RetryPolicy, label: &str, mut f: F) -> Result<T, CopierError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CopierError>>,
{
    let mut last_err = None;
    for attempt in 0..=policy.max_attempts {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = calculate_backoff_delay(policy, attempt);
                warn!(
                    operation = label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying after classified error"
                );
                tokio::time::sleep(delay).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.expect("loop always assigns an error before exhausting attempts"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure_time: Option<Instant>,
    failure_threshold: u32,
    timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure_time: None,
            failure_threshold,
            timeout,
        }
    }

    fn should_attempt_reset(&self) -> bool {
        match self.last_failure_time {
            Some(t) => t.elapsed() >= self.timeout,
            None => false,
        }
    }

    /// Returns true if a call is currently allowed through.
    pub fn pre_call(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if self.should_attempt_reset() {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.failure_count = 0;
        self.last_failure_time = None;
    }

    /// Returns true if this failure just transitioned the breaker to open.
    pub fn record_failure(&mut self) -> bool {
        self.failure_count += 1;
        self.last_failure_time = Some(Instant::now());
        if self.failure_count >= self.failure_threshold {
            let was_open_before = self.state == BreakerState::Open;
            self.state = BreakerState::Open;
            return !was_open_before;
        }
        false
    }
}

/// A per-account-id map of circuit breakers, serialized behind one mutex
/// since breaker mutation is synchronous and rare.
pub struct BreakerRegistry {
    breakers: tokio::sync::Mutex<HashMap<String, CircuitBreaker>>,
    failure_threshold: u32,
    timeout: Duration,
}

impl BreakerRegistry {
    pub fn new(failure_threshold: u32, timeout: Duration) -> Self {
        Self {
            breakers: tokio::sync::Mutex::new(HashMap::new()),
            failure_threshold,
            timeout,
        }
    }

    pub async fn pre_call(&self, account_id: &str) -> bool {
        let mut map = self.breakers.lock().await;
        let breaker = map
            .entry(account_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.failure_threshold, self.timeout));
        breaker.pre_call()
    }

    pub async fn record_success(&self, account_id: &str) {
        let mut map = self.breakers.lock().await;
        if let Some(b) = map.get_mut(account_id) {
            b.record_success();
        }
    }

    /// Returns `(new_state, just_opened)`.
    pub async fn record_failure(&self, account_id: &str) -> (BreakerState, bool) {
        let mut map = self.breakers.lock().await;
        let breaker = map
            .entry(account_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.failure_threshold, self.timeout));
        let just_opened = breaker.record_failure();
        (breaker.state, just_opened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_bounded_by_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            exponential_base: 2.0,
            jitter: false,
        };
        assert_eq!(calculate_backoff_delay(&policy, 0).as_millis(), 1000);
        assert_eq!(calculate_backoff_delay(&policy, 1).as_millis(), 2000);
        assert_eq!(calculate_backoff_delay(&policy, 2).as_millis(), 4000);
        // 1000 * 2^4 = 16000, capped to 10000
        assert_eq!(calculate_backoff_delay(&policy, 4).as_millis(), 10_000);
    }

    #[test]
    fn jitter_never_exceeds_cap() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 10_000,
            exponential_base: 2.0,
            jitter: true,
        };
        for attempt in 0..6 {
            let d = calculate_backoff_delay(&policy, attempt);
            assert!(d.as_millis() <= 10_000);
        }
    }

    #[tokio::test]
    async fn retries_retryable_errors_until_success() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            exponential_base: 1.0,
            jitter: false,
        };
        let mut calls = 0;
        let result: Result<i32, CopierError> = with_retry(&policy, "test", || {
            calls += 1;
            let attempt = calls;
            async move {
                if attempt < 3 {
                    Err(CopierError::TransientUpstream("boom".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn does_not_retry_non_retryable_errors() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            exponential_base: 1.0,
            jitter: false,
        };
        let mut calls = 0;
        let result: Result<i32, CopierError> = with_retry(&policy, "test", || {
            calls += 1;
            async move { Err(CopierError::InsufficientFunds("nope".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn exhausts_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 1,
            max_delay_ms: 2,
            exponential_base: 1.0,
            jitter: false,
        };
        let mut calls = 0;
        let result: Result<i32, CopierError> = with_retry(&policy, "test", || {
            calls += 1;
            async move { Err(CopierError::RateLimited("slow down".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 3); // max_attempts + 1 total tries
    }

    #[test]
    fn breaker_opens_after_threshold_and_fails_fast() {
        let mut b = CircuitBreaker::new(3, Duration::from_secs(300));
        assert!(b.pre_call());
        b.record_failure();
        assert!(b.pre_call());
        b.record_failure();
        assert!(b.pre_call());
        let just_opened = b.record_failure();
        assert!(just_opened);
        assert_eq!(b.state, BreakerState::Open);
        assert!(!b.pre_call());
    }

    #[test]
    fn breaker_half_open_failure_reopens_immediately() {
        let mut b = CircuitBreaker::new(1, Duration::from_millis(0));
        b.record_failure();
        assert_eq!(b.state, BreakerState::Open);
        // timeout is zero, so the next pre_call transitions to half_open.
        assert!(b.pre_call());
        assert_eq!(b.state, BreakerState::HalfOpen);
        b.record_failure();
        assert_eq!(b.state, BreakerState::Open);
    }

    #[test]
    fn breaker_success_from_half_open_closes_and_resets() {
        let mut b = CircuitBreaker::new(1, Duration::from_millis(0));
        b.record_failure();
        assert!(b.pre_call());
        b.record_success();
        assert_eq!(b.state, BreakerState::Closed);
        assert_eq!(b.failure_count, 0);
        assert!(b.last_failure_time.is_none());
    }
}
