//! Bounded-concurrency fetch-with-retry-and-dedupe pipeline
//!
//! A [`ScrapeJob`] supplies the source-specific steps: enumerate work items,
//! check whether an item is already stored, fetch it, persist it.
//! [`run_pipeline`] drives every item through
//! `gate -> fetch -> persist` under a [`ConcurrencyLimiter`] and folds the
//! per-item outcomes into a [`JobSummary`]. Failures stay inside the item
//! that produced them.

pub mod fetcher;
pub mod limiter;
pub mod retry;

use std::fmt;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, error, info};

pub use fetcher::{BoundedFetcher, FetchError};
pub use limiter::{ConcurrencyLimiter, LimiterClosed};
pub use retry::{RetryDelay, RetryPolicy};

use crate::config::DEFAULT_CONCURRENCY;

/// One unit of fetch-and-store work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem<K> {
    /// Natural key used by the dedupe gate and the upsert
    pub key: K,
    /// URL the fetcher requests
    pub target: String,
    /// Parent `vulnerability` row
    pub vulnerability_id: i32,
}

/// Source-specific steps of a scraping job
#[async_trait]
pub trait ScrapeJob: Send + Sync + 'static {
    type Key: fmt::Display + Clone + Send + Sync + 'static;
    type Output: Send + 'static;

    fn name(&self) -> &'static str;

    /// Runs once before enumeration, typically to create tables
    async fn prepare(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn enumerate(&self) -> anyhow::Result<Vec<WorkItem<Self::Key>>>;

    /// Dedupe gate: whether a result for this key is already persisted
    async fn is_stored(&self, item: &WorkItem<Self::Key>) -> anyhow::Result<bool>;

    async fn fetch(&self, item: &WorkItem<Self::Key>) -> Result<Self::Output, FetchError>;

    async fn persist(&self, item: &WorkItem<Self::Key>, output: Self::Output) -> anyhow::Result<()>;
}

/// Terminal state of one work item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Persisted,
    Skipped,
    GateFailed(String),
    FetchFailed(String),
    PersistFailed(String),
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub concurrency: usize,
    /// Pause taken after each persisted item, still holding the permit
    pub politeness_delay: Option<RetryDelay>,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            politeness_delay: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemFailure {
    pub key: String,
    pub stage: &'static str,
    pub error: String,
}

/// Aggregated result of one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobSummary {
    pub job: String,
    pub enumerated: usize,
    pub persisted: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Tasks that panicked; their keys are unknown
    pub panicked: usize,
    pub failures: Vec<ItemFailure>,
}

impl JobSummary {
    fn new(job: &str, enumerated: usize) -> Self {
        Self {
            job: job.to_string(),
            enumerated,
            ..Self::default()
        }
    }

    fn record(&mut self, key: String, outcome: ItemOutcome) {
        let (stage, error) = match outcome {
            ItemOutcome::Persisted => {
                self.persisted += 1;
                return;
            }
            ItemOutcome::Skipped => {
                self.skipped += 1;
                return;
            }
            ItemOutcome::GateFailed(error) => ("gate", error),
            ItemOutcome::FetchFailed(error) => ("fetch", error),
            ItemOutcome::PersistFailed(error) => ("persist", error),
        };
        self.failed += 1;
        self.failures.push(ItemFailure { key, stage, error });
    }
}

/// Drive every enumerated item of `job` through the pipeline.
///
/// Errors are returned only for setup steps (`prepare`, `enumerate`). Item
/// failures end up in the summary.
pub async fn run_pipeline<J: ScrapeJob>(
    job: Arc<J>,
    options: &PipelineOptions,
) -> anyhow::Result<JobSummary> {
    let name = job.name();

    job.prepare()
        .await
        .with_context(|| format!("{name}: failed to prepare the store"))?;
    let items = job
        .enumerate()
        .await
        .with_context(|| format!("{name}: failed to enumerate work items"))?;

    info!(
        job = name,
        items = items.len(),
        concurrency = options.concurrency,
        "starting pipeline"
    );

    let mut summary = JobSummary::new(name, items.len());
    let mut limiter = ConcurrencyLimiter::new(options.concurrency);

    for item in items {
        let job = Arc::clone(&job);
        let politeness = options.politeness_delay;
        limiter
            .launch(async move {
                let outcome = process_item(job.as_ref(), &item).await;
                if let (ItemOutcome::Persisted, Some(delay)) = (&outcome, politeness) {
                    tokio::time::sleep(delay.sample()).await;
                }
                (item.key.to_string(), outcome)
            })
            .await?;
    }

    for result in limiter.wait_all().await {
        match result {
            Ok((key, outcome)) => summary.record(key, outcome),
            Err(err) => {
                error!(job = name, error = %err, "work item task panicked");
                summary.panicked += 1;
            }
        }
    }

    info!(
        job = name,
        enumerated = summary.enumerated,
        persisted = summary.persisted,
        skipped = summary.skipped,
        failed = summary.failed,
        panicked = summary.panicked,
        "pipeline finished"
    );
    Ok(summary)
}

async fn process_item<J: ScrapeJob>(job: &J, item: &WorkItem<J::Key>) -> ItemOutcome {
    match job.is_stored(item).await {
        Ok(true) => {
            debug!(key = %item.key, "already stored, skipping");
            return ItemOutcome::Skipped;
        }
        Ok(false) => {}
        Err(err) => {
            error!(key = %item.key, error = %format!("{err:#}"), "existence check failed, abandoning item");
            return ItemOutcome::GateFailed(format!("{err:#}"));
        }
    }

    let output = match job.fetch(item).await {
        Ok(output) => output,
        Err(err) => {
            error!(key = %item.key, url = %item.target, error = %err, "fetch failed, abandoning item");
            return ItemOutcome::FetchFailed(err.to_string());
        }
    };

    match job.persist(item, output).await {
        Ok(()) => {
            info!(key = %item.key, "stored");
            ItemOutcome::Persisted
        }
        Err(err) => {
            error!(key = %item.key, error = %format!("{err:#}"), "failed to store item");
            ItemOutcome::PersistFailed(format!("{err:#}"))
        }
    }
}
