use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

/// Retry policy for transient failures when talking to the backend.
///
/// A failed attempt `k` (1-based) is retried after `base_delay * k`, so
/// with the defaults the waits are 250ms and 500ms before attempts two
/// and three.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Runs `attempt_fn` up to `policy.max_attempts` times, sleeping between
/// attempts. Returns the last error once attempts are exhausted.
pub async fn execute_with_retry<F, Fut, T, E>(
    operation: &str,
    policy: &RetryPolicy,
    mut attempt_fn: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match attempt_fn().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(
                        target: "souk::utils::retry",
                        "{} succeeded on attempt {}",
                        operation,
                        attempt
                    );
                }
                return Ok(value);
            }
            Err(err) if attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt);
                tracing::warn!(
                    target: "souk::utils::retry",
                    "{} failed on attempt {} ({}), retrying in {:?}",
                    operation,
                    attempt,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                tracing::error!(
                    target: "souk::utils::retry",
                    "{} failed after {} attempts: {}",
                    operation,
                    attempt,
                    err
                );
                return Err(err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Pops scripted results off a queue, one per attempt.
    fn scripted(
        outcomes: Vec<Result<u32, &'static str>>,
    ) -> (
        Arc<Mutex<VecDeque<Result<u32, &'static str>>>>,
        Arc<Mutex<u32>>,
    ) {
        (
            Arc::new(Mutex::new(outcomes.into_iter().collect())),
            Arc::new(Mutex::new(0)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_first_attempt() {
        let (queue, calls) = scripted(vec![Ok(7)]);
        let result = execute_with_retry("test_op", &RetryPolicy::default(), || {
            let queue = queue.clone();
            let calls = calls.clone();
            async move {
                *calls.lock().unwrap() += 1;
                queue.lock().unwrap().pop_front().unwrap()
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let (queue, calls) = scripted(vec![Err("timeout"), Err("timeout"), Ok(42)]);
        let result = execute_with_retry("test_op", &RetryPolicy::default(), || {
            let queue = queue.clone();
            let calls = calls.clone();
            async move {
                *calls.lock().unwrap() += 1;
                queue.lock().unwrap().pop_front().unwrap()
            }
        })
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_last_error_when_exhausted() {
        let (queue, calls) = scripted(vec![Err("a"), Err("b"), Err("c")]);
        let result = execute_with_retry("test_op", &RetryPolicy::default(), || {
            let queue = queue.clone();
            let calls = calls.clone();
            async move {
                *calls.lock().unwrap() += 1;
                queue.lock().unwrap().pop_front().unwrap()
            }
        })
        .await;
        assert_eq!(result, Err("c"));
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_linear_backoff_delays() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        };
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));

        let (queue, _calls) = scripted(vec![Err("x"), Err("x"), Ok(1)]);
        let start = tokio::time::Instant::now();
        let result = execute_with_retry("test_op", &policy, || {
            let queue = queue.clone();
            async move { queue.lock().unwrap().pop_front().unwrap() }
        })
        .await;
        assert_eq!(result, Ok(1));
        // 100ms after the first failure plus 200ms after the second.
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }
}
