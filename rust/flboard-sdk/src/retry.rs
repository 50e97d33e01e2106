//! Bounded retries with a fixed delay.

use std::{future::Future, time::Duration};

use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// The number of attempts, the first one included. Zero is treated as one.
    pub max_attempts: u32,
    /// The pause between two attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

/// Returned by [`retry`] when every attempt failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exhausted<E> {
    pub attempts: u32,
    /// The error of the last attempt.
    pub last: E,
}

/// Runs `attempt` until it succeeds or `policy.max_attempts` is reached,
/// sleeping `policy.delay` in between. `attempt` is given the number of
/// the attempt, starting at 1.
pub async fn retry<F, Fut, T, E>(policy: RetryPolicy, mut attempt: F) -> Result<T, Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Debug,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        match attempt(attempts).await {
            Ok(value) => return Ok(value),
            Err(last) if attempts >= max_attempts => return Err(Exhausted { attempts, last }),
            Err(e) => {
                debug!("attempt {}/{} failed: {:?}", attempts, max_attempts, e);
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures() {
        let start = Instant::now();
        let result = retry(RetryPolicy::new(3, Duration::from_secs(2)), |n| async move {
            if n < 3 {
                Err(n)
            } else {
                Ok("done")
            }
        })
        .await;
        assert_eq!(result, Ok("done"));
        assert_eq!(start.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up() {
        let mut calls = 0;
        let result: Result<(), _> = retry(RetryPolicy::new(3, Duration::from_secs(2)), |n| {
            calls += 1;
            async move { Err(format!("attempt {}", n)) }
        })
        .await;
        assert_eq!(
            result,
            Err(Exhausted {
                attempts: 3,
                last: "attempt 3".to_string()
            })
        );
        assert_eq!(calls, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_attempts_runs_once() {
        let mut calls = 0;
        let result: Result<(), _> = retry(RetryPolicy::new(0, Duration::from_secs(1)), |_| {
            calls += 1;
            async { Err(()) }
        })
        .await;
        assert_eq!(result.unwrap_err().attempts, 1);
        assert_eq!(calls, 1);
    }
}
