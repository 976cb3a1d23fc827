//! Bounded exponential backoff with jitter for best-effort store operations.

use observability_deps::tracing::info;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Retry policy for operations against an eventually consistent store.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, including the first.
    pub max_attempts: usize,
    /// Backoff before the second attempt.
    pub init_backoff: Duration,
    /// Multiplier applied per round.
    pub base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            init_backoff: Duration::from_millis(100),
            base: 3.,
        }
    }
}

impl RetryConfig {
    /// Runs `op` until it succeeds or the attempt budget is spent, sleeping
    /// a jittered, exponentially growing interval between rounds.
    pub async fn run<F, Fut, T, E>(&self, task_name: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let mut backoff = self.init_backoff.as_secs_f64();
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) if attempt >= self.max_attempts => return Err(error),
                Err(error) => {
                    let jittered = rand::thread_rng().gen_range((backoff / 2.)..=backoff);
                    info!(
                        task_name,
                        attempt,
                        backoff_millis = (jittered * 1000.) as u64,
                        %error,
                        "operation failed, backing off",
                    );
                    tokio::time::sleep(Duration::from_secs_f64(jittered)).await;
                    backoff *= self.base;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn returns_first_success() {
        let config = RetryConfig::default();
        let calls = AtomicUsize::new(0);
        let result: Result<u32, String> = config
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(7) }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_until_budget_spent() {
        let config = RetryConfig {
            max_attempts: 3,
            init_backoff: Duration::from_millis(1),
            base: 1.,
        };
        let calls = AtomicUsize::new(0);
        let result: Result<u32, String> = config
            .run("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("nope".to_string()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn eventually_succeeds() {
        let config = RetryConfig {
            max_attempts: 5,
            init_backoff: Duration::from_millis(1),
            base: 1.,
        };
        let calls = AtomicUsize::new(0);
        let result: Result<usize, String> = config
            .run("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err("not yet".to_string())
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
    }
}
