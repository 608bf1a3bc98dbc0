//! Bounded retry with configurable back-off

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use super::fetcher::FetchError;

/// Pause inserted between two attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDelay {
    Fixed(Duration),
    /// Uniformly random within `min..=max`
    Uniform { min: Duration, max: Duration },
}

impl RetryDelay {
    /// Random pause between 1 and 2000 ms
    pub const fn jitter() -> Self {
        Self::Uniform {
            min: Duration::from_millis(1),
            max: Duration::from_millis(2000),
        }
    }

    pub fn sample(&self) -> Duration {
        match *self {
            Self::Fixed(delay) => delay,
            Self::Uniform { min, max } if max <= min => min,
            Self::Uniform { min, max } => {
                let millis = rand::rng().random_range(min.as_millis()..=max.as_millis());
                Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
            }
        }
    }
}

fn retry_always(_: &FetchError) -> bool {
    true
}

/// How often and how patiently to retry one network operation
#[derive(Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
    delay: RetryDelay,
    retry_on: fn(&FetchError) -> bool,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("delay", &self.delay)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: RetryDelay) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
            retry_on: retry_always,
        }
    }

    /// Page scraping: five attempts with a random pause, skipping only
    /// errors that can never succeed
    pub fn scraping() -> Self {
        Self::new(5, RetryDelay::jitter()).retry_if(FetchError::is_retryable)
    }

    /// File downloads: five attempts two seconds apart
    pub fn download() -> Self {
        Self::new(5, RetryDelay::Fixed(Duration::from_secs(2))).retry_if(FetchError::is_retryable)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_delay(mut self, delay: RetryDelay) -> Self {
        self.delay = delay;
        self
    }

    /// Only retry errors for which `predicate` returns true
    pub fn retry_if(mut self, predicate: fn(&FetchError) -> bool) -> Self {
        self.retry_on = predicate;
        self
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt ceiling is reached.
    ///
    /// `op` receives the 1-based attempt number. After the last attempt the
    /// final error is wrapped in [`FetchError::Exhausted`].
    pub async fn run<T, F, Fut>(&self, target: &str, mut op: F) -> Result<T, FetchError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt = 1;
        loop {
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !(self.retry_on)(&err) {
                return Err(err);
            }

            if attempt >= self.max_attempts {
                return Err(FetchError::Exhausted {
                    target: target.to_string(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let pause = self.delay.sample();
            tracing::warn!(
                url = %target,
                attempt,
                max_attempts = self.max_attempts,
                pause_ms = pause.as_millis() as u64,
                error = %err,
                "request failed, retrying"
            );
            tokio::time::sleep(pause).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractors::ExtractError;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn extract_error(target: &str) -> FetchError {
        FetchError::Extract {
            target: target.to_string(),
            source: ExtractError::EmptyDocument,
        }
    }

    fn quick(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::new(max_attempts, RetryDelay::Fixed(Duration::ZERO))
    }

    #[test]
    fn test_uniform_delay_stays_in_bounds() {
        let delay = RetryDelay::jitter();
        for _ in 0..200 {
            let sample = delay.sample();
            assert!(sample >= Duration::from_millis(1));
            assert!(sample <= Duration::from_millis(2000));
        }
    }

    #[test]
    fn test_degenerate_uniform_delay() {
        let delay = RetryDelay::Uniform {
            min: Duration::from_millis(7),
            max: Duration::from_millis(3),
        };
        assert_eq!(delay.sample(), Duration::from_millis(7));
    }

    #[test]
    fn test_attempts_never_below_one() {
        assert_eq!(quick(0).max_attempts, 1);
        assert_eq!(RetryPolicy::scraping().with_max_attempts(0).max_attempts, 1);
        assert_eq!(RetryPolicy::download().max_attempts, 5);
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let result = quick(5)
            .run("https://example.test/a", move |attempt| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    if attempt < 3 {
                        Err(extract_error("https://example.test/a"))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhaustion_reports_attempts_and_last_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let err = quick(4)
            .run("https://example.test/b", move |_| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(extract_error("https://example.test/b"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match err {
            FetchError::Exhausted {
                target,
                attempts,
                last,
            } => {
                assert_eq!(target, "https://example.test/b");
                assert_eq!(attempts, 4);
                assert!(matches!(*last, FetchError::Extract { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_error_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&calls);
        let err = quick(5)
            .retry_if(|_| false)
            .run("https://example.test/c", move |_| {
                let seen = Arc::clone(&seen);
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(extract_error("https://example.test/c"))
                }
            })
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(err, FetchError::Extract { .. }));
    }
}
