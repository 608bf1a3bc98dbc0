//! Bounded task launcher
//!
//! At most `capacity` launched tasks are alive at once. [`ConcurrencyLimiter::launch`]
//! waits for a free slot before spawning, so the launching loop itself is
//! throttled, and [`ConcurrencyLimiter::wait_all`] acts as the completion barrier.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};

#[derive(Debug, Error)]
#[error("concurrency limiter is closed")]
pub struct LimiterClosed;

pub struct ConcurrencyLimiter<T> {
    permits: Arc<Semaphore>,
    tasks: JoinSet<T>,
    finished: Vec<Result<T, JoinError>>,
}

impl<T: Send + 'static> ConcurrencyLimiter<T> {
    /// A capacity of zero is raised to one
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity.max(1))),
            tasks: JoinSet::new(),
            finished: Vec::new(),
        }
    }

    /// Wait for a free slot, then spawn `task` holding it.
    ///
    /// The slot is released when the task finishes, including by panic.
    pub async fn launch<F>(&mut self, task: F) -> Result<(), LimiterClosed>
    where
        F: Future<Output = T> + Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| LimiterClosed)?;

        // Reap finished tasks so the set does not grow with the whole input.
        while let Some(result) = self.tasks.try_join_next() {
            self.finished.push(result);
        }

        self.tasks.spawn(async move {
            let _permit = permit;
            task.await
        });
        Ok(())
    }

    /// Block until every launched task has finished
    pub async fn wait_all(mut self) -> Vec<Result<T, JoinError>> {
        let mut results = std::mem::take(&mut self.finished);
        while let Some(result) = self.tasks.join_next().await {
            results.push(result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_in_flight_never_exceeds_capacity() {
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut limiter = ConcurrencyLimiter::new(3);

        for i in 0..20usize {
            let current = Arc::clone(&current);
            let peak = Arc::clone(&peak);
            limiter
                .launch(async move {
                    let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    current.fetch_sub(1, Ordering::SeqCst);
                    i
                })
                .await
                .unwrap();
        }

        let mut results: Vec<usize> = limiter
            .wait_all()
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        results.sort_unstable();

        assert_eq!(results, (0..20).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
    }

    #[tokio::test]
    async fn test_zero_capacity_is_raised() {
        let limiter: ConcurrencyLimiter<()> = ConcurrencyLimiter::new(0);
        assert_eq!(limiter.permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_panicking_task_releases_slot() {
        let mut limiter: ConcurrencyLimiter<()> = ConcurrencyLimiter::new(1);
        limiter
            .launch(async { panic!("worker failure") })
            .await
            .unwrap();
        // Would wait forever if the panicked task kept its slot.
        limiter.launch(async {}).await.unwrap();

        let results = limiter.wait_all().await;
        assert_eq!(results.len(), 2);
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
        assert!(results.iter().any(|r| r.as_ref().is_err_and(|e| e.is_panic())));
    }
}
