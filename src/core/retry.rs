// Retry with exponential backoff for arbitrary async work

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles after each further failure.
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Sleep before the attempt following failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` attempts have failed,
/// returning the last error in that case.
///
/// `op` receives the 0-based attempt number. Every failure is logged with
/// `label` before the backoff sleep.
pub async fn run_with_retry<T, E, F, Fut>(policy: &RetryPolicy, label: &str, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;
    loop {
        match op(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(operation = label, attempt = attempt + 1, "Succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if attempt + 1 >= attempts => {
                warn!(
                    operation = label,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    error = %e,
                    "Giving up after final attempt"
                );
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation = label,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_runs_exactly_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(3, Duration::from_secs(1));

        let counter = calls.clone();
        let result: Result<(), String> = run_with_retry(&policy, "always-fails", |attempt| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(format!("failure #{attempt}"))
            }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(result.unwrap_err(), "failure #2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_twice_then_succeed() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default();
        let start = Instant::now();

        let counter = calls.clone();
        let result: Result<&str, String> = run_with_retry(&policy, "flaky", |_| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err("not yet".to_string()) } else { Ok("done") }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Slept 1s then 2s.
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt_does_not_sleep() {
        let start = Instant::now();
        let result: Result<u8, String> =
            run_with_retry(&RetryPolicy::default(), "ok", |_| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[test]
    fn test_delay_doubles() {
        let policy = RetryPolicy::new(5, Duration::from_millis(100));
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(800));
    }

    #[test]
    fn test_zero_attempts_is_clamped() {
        assert_eq!(RetryPolicy::new(0, Duration::ZERO).max_attempts, 1);
    }
}
