//! Exponential backoff with jitter around a whole component call.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use rand::{thread_rng, Rng};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random extra wait added to every delay.
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_jitter: Duration::ZERO,
        }
    }

    /// Delay before the attempt following `attempt` (1-based), jitter excluded.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(31);
        self.initial_delay
            .saturating_mul(1u32 << doublings)
            .min(self.max_delay)
    }

    fn jitter(&self) -> Duration {
        let max_ms = self.max_jitter.as_millis() as u64;
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(thread_rng().gen_range(0..max_ms))
    }
}

/// Run `task` until it succeeds or `policy.max_attempts` attempts failed, sleeping
/// a doubling, capped, jittered delay in between. Returns the last error.
/// Errors are logged with `{:#}`, so an anyhow error shows its whole chain.
pub async fn execute_with_retry<T, E, F, Fut>(
    name: &str,
    policy: &RetryPolicy,
    mut task: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match task().await {
            Ok(value) => {
                info!(task = name, attempt, "completed");
                return Ok(value);
            }
            Err(e) if attempt >= attempts => {
                warn!(task = name, attempt, error = %format!("{e:#}"), "all retries failed");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.base_delay(attempt) + policy.jitter();
                warn!(
                    task = name,
                    attempt,
                    error = %format!("{e:#}"),
                    delay_ms = delay.as_millis() as u64,
                    "attempt failed, retrying"
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
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_doubles_up_to_cap() {
        let policy = RetryPolicy::default();
        let secs: Vec<u64> = (1..=6).map(|a| policy.base_delay(a).as_secs()).collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 30, 30]);
    }

    #[tokio::test]
    async fn stops_at_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = execute_with_retry("ingestion", &RetryPolicy::immediate(5), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("attempt {n} failed"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_with_last_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = execute_with_retry("rotation", &RetryPolicy::immediate(4), || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            Err(format!("attempt {n} failed"))
        })
        .await;
        assert_eq!(result, Err("attempt 4 failed".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn sleeps_between_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            max_jitter: Duration::ZERO,
        };
        let start = tokio::time::Instant::now();
        let result: Result<(), &str> = execute_with_retry("tick", &policy, || async { Err("down") }).await;
        assert!(result.is_err());
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(6) && waited < Duration::from_secs(7));
    }
}
